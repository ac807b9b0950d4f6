//! Randomized trap controller
//!
//! Traps a write with a fixed probability whenever no other trap is active,
//! so at most one thread in the process is ever parked.

use super::{random_delay, seeded_rng, ControllerContext, TrapController};
use crate::config::RandomizedParams;
use crate::error::RaceDetected;
use crate::interception::InterceptionPoint;
use crate::object_id::InstanceRef;
use crate::trap::Trap;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::Rng;
use std::sync::Arc;

pub struct RandomizedController {
    ctx: ControllerContext,
    delay_probability: f64,
    max_delay_ms: u64,
    rng: Mutex<StdRng>,
}

impl RandomizedController {
    pub fn new(ctx: ControllerContext, params: &RandomizedParams) -> Self {
        Self {
            ctx,
            delay_probability: params.delay_probability,
            max_delay_ms: params.max_delay_ms,
            rng: Mutex::new(seeded_rng(params.random_seed)),
        }
    }
}

impl TrapController for RandomizedController {
    fn on_call(
        &self,
        instance: Option<InstanceRef>,
        mut point: InterceptionPoint,
    ) -> Result<(), RaceDetected> {
        let Some(classification) = self.ctx.classify(&point.callee, instance) else {
            return Ok(());
        };
        point.is_write = classification.is_write;
        point.object_id = self.ctx.object_for(&classification, instance);
        let point = Arc::new(point);

        let bucket = self.ctx.traps.bucket(classification.group_name());
        let (conflicts, trap) = {
            let mut guard = bucket.lock();
            let conflicts: Vec<Arc<Trap>> = guard
                .traps_on(point.object_id)
                .iter()
                .filter(|t| {
                    t.point.thread_id != point.thread_id && t.conflicts_with(point.is_write)
                })
                .cloned()
                .collect();

            let mut trap = None;
            if conflicts.is_empty() && point.is_write {
                let mut rng = self.rng.lock();
                if rng.gen::<f64>() < self.delay_probability
                    && self.ctx.active.try_enter_exclusive()
                {
                    let delay = random_delay(&mut *rng, self.max_delay_ms);
                    point.capture_stack();
                    let new_trap = Arc::new(Trap::new(
                        self.ctx.traps.next_trap_id(),
                        Arc::clone(&point),
                        classification,
                        delay,
                    ));
                    guard.register(Arc::clone(&new_trap));
                    trap = Some(new_trap);
                }
            }
            (conflicts, trap)
        };

        let mut race = None;
        for conflict in &conflicts {
            let found = self.ctx.handle_race(conflict, &point);
            race = race.or(found);
        }

        if let Some(trap) = trap {
            self.ctx.sink.trap_set(&trap);
            trap.wait();
            bucket.remove(&trap);
            self.ctx.active.exit();
        }

        self.ctx.finish(race)
    }

    fn name(&self) -> &'static str {
        "randomized"
    }

    fn context(&self) -> &ControllerContext {
        &self.ctx
    }
}
