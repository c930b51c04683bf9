//! Endpoint client and arbiter running against each other over an
//! in-memory wire.

mod common;

use common::Host;

use fastpass::arbiter::{build, AdmissionCore, CommConfig, CommCore};
use fastpass::client::flow::{PktInfo, PktProto};
use fastpass::client::{Client, Config};
use fastpass::emu::{EmuState, FabricConfig};

const TSLOT: u64 = 13_000;
const ARB_IP: u32 = 0x0A0000FE;
const CLIENT_IP: u32 = 0x0A000005;
const CLIENT_ID: u16 = 5;

/// How many timeslots the fabric is allowed to run ahead of the wall
/// clock, so grants always land in the client's future.
const FABRIC_LEAD: u64 = 8;

fn endpoint_ips() -> Vec<u32> {
    (0..32).map(|i| 0x0A000000 + i).collect()
}

fn client_config() -> Config {
    Config {
        local_ip: CLIENT_IP,
        controller_ip: ARB_IP,
        tslot_nsec: TSLOT,
        ..Default::default()
    }
}

fn data_pkt(dst_ip: u32, len: u32) -> PktInfo {
    PktInfo {
        len_bytes: len,
        priority: 0,
        proto: PktProto::Tcp,
        src_ip: CLIENT_IP,
        dst_ip,
        dst_port: 5001,
    }
}

struct Trial {
    client: Client<u32>,
    host: Host,
    comm: CommCore,
    admission: AdmissionCore<EmuState>,
    t: u64,
    t0: u64,
    fabric_slots: u64,
}

impl Trial {
    fn new(t0: u64) -> Self {
        let comm_cfg = CommConfig {
            arbiter_ip: ARB_IP,
            endpoint_ips: endpoint_ips(),
            ..Default::default()
        };
        let (comm, admission) = build(comm_cfg, FabricConfig::default(), t0 / TSLOT + FABRIC_LEAD);

        Self {
            client: Client::new(client_config(), t0).unwrap(),
            host: Host::default(),
            comm,
            admission,
            t: t0,
            t0,
            fabric_slots: 0,
        }
    }

    /// One microsecond of simulated world: timers, wire, fabric, egress.
    fn tick(&mut self, released: &mut Vec<u32>) {
        for timer in self.host.due_timers(self.t) {
            self.client.handle_timer(timer, self.t, &mut self.host);
        }

        let frames: Vec<_> = self.host.frames.drain(..).collect();
        for frame in frames {
            self.comm.handle_rx(&frame, CLIENT_IP, self.t);
        }

        self.comm.handle_timeouts(self.t);

        let mut to_client = Vec::new();
        self.comm.process_admitted(self.t, &mut |endpoint, frame: &[u8]| {
            if endpoint == CLIENT_ID {
                to_client.push(frame.to_vec());
            }
        });
        for frame in to_client {
            self.client
                .handle_rx(&frame, ARB_IP, CLIENT_IP, self.t, &mut self.host);
        }

        let wall_slots = (self.t - self.t0) / TSLOT;
        while self.fabric_slots < wall_slots + FABRIC_LEAD {
            self.admission.step();
            self.fabric_slots += 1;
        }

        while let Some(pkt) = self.client.dequeue(self.t, &mut self.host) {
            released.push(pkt);
        }

        self.t += 1_000;
    }

    fn check_counter_invariants(&self) {
        let (demand, requested, alloc, acked) = self.client.counters();
        assert!(demand >= requested, "demand {} < requested {}", demand, requested);
        assert!(requested >= acked, "requested {} < acked {}", requested, acked);
        assert!(alloc <= demand, "alloc {} > demand {}", alloc, demand);
    }
}

#[test]
fn request_alloc_release_cycle() {
    let t0 = 10_000_000;
    let mut trial = Trial::new(t0);

    for id in 0..2u32 {
        trial
            .client
            .enqueue(data_pkt(0x0A000003, 1500), id, t0, &mut trial.host)
            .unwrap();
    }

    let deadline = t0 + 3_000 * TSLOT;
    let mut released = Vec::new();
    while released.len() < 2 && trial.t < deadline {
        trial.tick(&mut released);
        trial.check_counter_invariants();
    }

    assert_eq!(released, vec![0, 1]);

    let (demand, requested, alloc, acked) = trial.client.counters();
    assert_eq!(demand, 2);
    assert_eq!(requested, 2);
    assert_eq!(acked, 2);
    assert!(alloc >= 2);

    // Both ends agree on the reset time and the demand state
    assert!(trial.client.proto_stats().proto_resets >= 1);
    let arb_side = trial.comm.demand_table().get(CLIENT_ID, 3);
    assert!(arb_side.counters.demand >= 2);
    assert!(arb_side.counters.alloc >= 2);
    assert_eq!(trial.client.sched_stats().used_timeslots, 2);
}

#[test]
fn sustained_demand_stays_within_request_window() {
    let t0 = 50_000_000;
    let mut trial = Trial::new(t0);

    let mut released = Vec::new();
    let mut next_id = 0u32;

    // Feed a new packet every few microseconds for a while, to several
    // destinations, and watch every counter invariant along the way.
    for round in 0..600u64 {
        let dst = 0x0A000000 + [3u32, 7, 9][round as usize % 3];
        if round % 4 == 0 {
            let info = data_pkt(dst, 1500);
            let t = trial.t;
            if trial
                .client
                .enqueue(info, next_id, t, &mut trial.host)
                .is_ok()
            {
                next_id += 1;
            }
        }

        trial.tick(&mut released);
        trial.check_counter_invariants();

        let (_, requested, _, acked) = trial.client.counters();
        assert!(
            requested - acked <= fastpass::FASTPASS_REQUEST_WINDOW,
            "unacked requests exceeded the request window"
        );
    }

    // Let the system drain
    let deadline = trial.t + 2_000 * TSLOT;
    while released.len() < next_id as usize && trial.t < deadline {
        trial.tick(&mut released);
    }

    assert_eq!(released.len(), next_id as usize);

    // Nothing lost, nothing duplicated
    let mut sorted = released.clone();
    sorted.sort_unstable();
    assert_eq!(sorted, (0..next_id).collect::<Vec<_>>());
}
