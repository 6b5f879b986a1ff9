//! [`MoveSupervisor`] – drives one move mission to completion.
//!
//! ```text
//! Dispatch ──accepted──▶ Poll ──Success──▶ done
//!                          │
//!                          ├──Failed/Abort──▶ RemoteServiceError
//!                          └──cancel──▶ Stop (best effort) ──▶ Canceled
//! ```
//!
//! Every dispatch uses a fresh mission id and polling ignores status that
//! belongs to any other mission, so leftovers from an earlier move can never
//! complete this one.

use std::sync::Arc;
use std::time::Duration;

use botflow_link::StatusCache;
use botflow_types::{BotError, MissionCode, MissionStatus, RoutineNode};
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info, instrument, warn};

use crate::action_client::{ActionClient, DeviceCommand, new_mission_id};
use crate::context::StepContext;
use crate::heartbeat::MIN_TICK;

#[derive(Debug, Clone)]
pub struct MoveConfig {
    pub poll_interval: Duration,
}

impl Default for MoveConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Target pose of a move node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoveTarget {
    pub x: f64,
    pub y: f64,
    pub orientation_deg: f64,
}

impl MoveTarget {
    pub fn from_node(node: &RoutineNode) -> Result<Self, BotError> {
        Ok(Self {
            x: node.number_param("x")?,
            y: node.number_param("y")?,
            orientation_deg: node.number_param("orientation")?,
        })
    }
}

pub struct MoveSupervisor {
    client: Arc<ActionClient>,
    cache: Option<Arc<StatusCache>>,
    config: MoveConfig,
}

impl MoveSupervisor {
    /// Without a cache, progress is read with direct status queries.
    pub fn new(client: Arc<ActionClient>, cache: Option<Arc<StatusCache>>, config: MoveConfig) -> Self {
        Self {
            client,
            cache,
            config,
        }
    }

    /// Dispatch a move to `target` and wait for the mission to finish.
    #[instrument(name = "move_mission", skip(self, ctx), fields(run_id = %ctx.run_id, step = %ctx.step))]
    pub async fn run(&self, ctx: &StepContext, target: MoveTarget) -> Result<String, BotError> {
        let mission_id = new_mission_id();
        self.client
            .invoke(
                ctx,
                DeviceCommand::Move {
                    mission_id: mission_id.clone(),
                    x: target.x,
                    y: target.y,
                    orientation_deg: target.orientation_deg,
                },
            )
            .await?;
        info!(mission_id = %mission_id, x = target.x, y = target.y, "move accepted, polling");

        let period = self.config.poll_interval.max(MIN_TICK);
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = ctx.cancelled() => return self.abort(ctx, &mission_id).await,
                _ = ticker.tick() => {}
            }

            let status = match self.read_status(ctx).await {
                Ok(status) => status,
                Err(_) if ctx.is_cancelled() => return self.abort(ctx, &mission_id).await,
                Err(e) => {
                    debug!(mission_id = %mission_id, error = %e, "no usable status yet");
                    ctx.heartbeat(&format!("waiting for mission {mission_id}"));
                    continue;
                }
            };

            if !status.is_mission(&mission_id) {
                debug!(
                    expected = %mission_id,
                    current = %status.mission_id,
                    "waiting for the robot to pick up the mission"
                );
                ctx.heartbeat(&format!("waiting for mission {mission_id}"));
                continue;
            }

            match status.mission_code {
                MissionCode::Success => {
                    return Ok(format!(
                        "Robot has reached the target location ({:.2}, {:.2})",
                        status.position.x, status.position.y
                    ));
                }
                code if code.is_failure() => {
                    return Err(BotError::RemoteServiceError(format!(
                        "move mission {mission_id} ended with {code:?}: {}",
                        status.mission_message
                    )));
                }
                _ => ctx.heartbeat(&format!(
                    "Robot currently at ({:.2}, {:.2})",
                    status.position.x, status.position.y
                )),
            }
        }
    }

    async fn read_status(&self, ctx: &StepContext) -> Result<MissionStatus, BotError> {
        match &self.cache {
            Some(cache) => cache.get(),
            None => self.client.status(ctx).await,
        }
    }

    /// Stop the robot and report cancellation.  The stop outcome is only
    /// logged.
    async fn abort(&self, ctx: &StepContext, mission_id: &str) -> Result<String, BotError> {
        info!(mission_id, "move canceled, stopping robot");
        if let Err(e) = self.client.stop(ctx).await {
            warn!(mission_id, error = %e, "failed to send stop command");
        }
        Err(BotError::Canceled(format!("move mission {mission_id} canceled")))
    }
}
