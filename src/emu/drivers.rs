//! Drivers connect endpoint groups and routers to the rings between them
//! and emulate one timeslot at a time.

use std::sync::Arc;

use rand::rngs::SmallRng;
use rand::Rng;

use crate::arbiter::ring::Ring;

use super::endpoint::EndpointGroup;
use super::packet::{EmuOutput, EmuPacket};
use super::qmgr::Dropper;
use super::router::Router;
use super::{EmuStat, ROUTER_MAX_BURST};

pub struct EndpointDriver {
    epg: EndpointGroup,
    /// Demand packets injected by the comm core.
    q_new_pkts: Arc<Ring<EmuPacket>>,
    q_to_router: Arc<Ring<EmuPacket>>,
    q_from_router: Arc<Ring<EmuPacket>>,
    q_resets: Arc<Ring<u16>>,
    scratch: Vec<EmuPacket>,
}

impl EndpointDriver {
    pub fn new(
        epg: EndpointGroup,
        q_new_pkts: Arc<Ring<EmuPacket>>,
        q_to_router: Arc<Ring<EmuPacket>>,
        q_from_router: Arc<Ring<EmuPacket>>,
        q_resets: Arc<Ring<u16>>,
    ) -> Self {
        Self {
            epg,
            q_new_pkts,
            q_to_router,
            q_from_router,
            q_resets,
            scratch: Vec::with_capacity(ROUTER_MAX_BURST),
        }
    }

    pub fn epg(&self) -> &EndpointGroup {
        &self.epg
    }

    /// One timeslot at this endpoint group.
    pub fn step(
        &mut self,
        time: u64,
        output: &mut EmuOutput,
        dropper: &mut Dropper,
        stat: &mut EmuStat,
    ) {
        // Endpoint resets first, so stale traffic never mixes with the
        // rebased backlog.
        while let Some(endpoint) = self.q_resets.dequeue() {
            self.epg.reset(endpoint);
        }

        // Deliver traffic that reached our endpoints last timeslot.
        let mut buf = std::mem::take(&mut self.scratch);
        self.q_from_router.dequeue_burst(&mut buf, ROUTER_MAX_BURST);
        for pkt in buf.drain(..) {
            self.epg.rcv_from_net(pkt, output);
        }

        // Pull fresh demand packets down from the comm core.
        self.q_new_pkts.dequeue_burst(&mut buf, ROUTER_MAX_BURST);
        for pkt in buf.drain(..) {
            self.epg.rcv_from_app(pkt, time, dropper);
        }

        // One packet per endpoint onto the wire.
        self.epg.pull_batch(ROUTER_MAX_BURST, &mut buf);
        for pkt in buf.drain(..) {
            if let Err(pkt) = self.q_to_router.enqueue(pkt) {
                // The router ring is full: the packet is lost here and the
                // source rebooks it like any other drop.
                stat.send_packets_failed += 1;
                dropper.drop_pkt(pkt);
            }
        }

        self.scratch = buf;
    }
}

pub struct RouterDriver {
    router: Router,
    q_ingress: Arc<Ring<EmuPacket>>,
    q_egress: Vec<(Arc<Ring<EmuPacket>>, u64)>,
    rng: SmallRng,
    cur_time: u64,
    drop_on_failed_enqueue: bool,
    scratch: Vec<EmuPacket>,
}

impl RouterDriver {
    pub fn new(
        router: Router,
        q_ingress: Arc<Ring<EmuPacket>>,
        q_egress: Vec<(Arc<Ring<EmuPacket>>, u64)>,
        rng: SmallRng,
        drop_on_failed_enqueue: bool,
    ) -> Self {
        Self {
            router,
            q_ingress,
            q_egress,
            rng,
            cur_time: 0,
            drop_on_failed_enqueue,
            scratch: Vec::with_capacity(ROUTER_MAX_BURST),
        }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// One timeslot at this router. Pulls happen before pushes, so a packet
    /// pushed in this timeslot cannot leave before the next.
    pub fn step(&mut self, dropper: &mut Dropper, stat: &mut EmuStat) {
        let mut buf = std::mem::take(&mut self.scratch);

        // Drain up to one packet per output port toward each neighbor.
        for (ring, port_mask) in self.q_egress.iter() {
            buf.clear();
            let n = self.router.pull_batch(*port_mask, ROUTER_MAX_BURST, &mut buf);
            stat.router_driver_pulled += n as u64;

            for pkt in buf.drain(..) {
                let mut pending = Some(pkt);
                while let Some(pkt) = pending.take() {
                    match ring.enqueue(pkt) {
                        Ok(()) => (),
                        Err(pkt) if self.drop_on_failed_enqueue => {
                            stat.send_packets_failed += 1;
                            dropper.drop_pkt(pkt);
                        }
                        Err(pkt) => {
                            // No space downstream; log and retry.
                            stat.send_packets_failed += 1;
                            pending = Some(pkt);
                        }
                    }
                }
            }
        }

        // Fetch a batch from the network and shuffle it so the router does
        // not systematically favor low-numbered endpoints.
        buf.clear();
        let n_pkts = self.q_ingress.dequeue_burst(&mut buf, ROUTER_MAX_BURST);

        for i in (1..n_pkts).rev() {
            let j = self.rng.gen_range(0..=i);
            buf.swap(i, j);
        }

        for pkt in buf.drain(..) {
            self.router.push(pkt, self.cur_time, dropper);
        }
        stat.router_driver_pushed += n_pkts as u64;

        self.scratch = buf;
        self.cur_time += 1;
    }
}
