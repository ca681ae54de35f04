//! Spawn capacity governance.
//!
//! [`SpawnGovernor`] tracks live agents per project and per dispatcher plus
//! a sliding window of recent spawns. Every check-and-record happens under a
//! single lock so concurrent dispatchers cannot oversubscribe a ceiling.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use super::SwarmPolicy;
use crate::messages::AgentType;
use crate::metrics::MetricsCollector;

const ONE_SECOND: Duration = Duration::from_secs(1);
const ONE_MINUTE: Duration = Duration::from_secs(60);

/// Why a spawn was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnDenial {
    GlobalCeiling { active: usize, limit: usize },
    ProjectCeiling { project_id: String, active: usize, limit: usize },
    DispatcherCeiling { active: usize, limit: usize },
    Throttled { retry_after: Duration },
}

impl SpawnDenial {
    pub fn is_throttled(&self) -> bool {
        matches!(self, SpawnDenial::Throttled { .. })
    }

    /// Error category used against the retry allow-list.
    pub fn category(&self) -> &'static str {
        match self {
            SpawnDenial::Throttled { .. } => "throttled",
            _ => "capacity",
        }
    }
}

impl fmt::Display for SpawnDenial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnDenial::GlobalCeiling { active, limit } => {
                write!(f, "global agent ceiling reached ({}/{})", active, limit)
            }
            SpawnDenial::ProjectCeiling {
                project_id,
                active,
                limit,
            } => write!(
                f,
                "project '{}' agent ceiling reached ({}/{})",
                project_id, active, limit
            ),
            SpawnDenial::DispatcherCeiling { active, limit } => {
                write!(f, "dispatcher ceiling reached ({}/{})", active, limit)
            }
            SpawnDenial::Throttled { retry_after } => {
                write!(f, "spawn rate throttled, retry after {:?}", retry_after)
            }
        }
    }
}

/// Result of a capacity check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnDecision {
    pub can_spawn: bool,
    pub denial: Option<SpawnDenial>,
}

impl SpawnDecision {
    fn from_check(result: Result<(), SpawnDenial>) -> Self {
        match result {
            Ok(()) => Self {
                can_spawn: true,
                denial: None,
            },
            Err(denial) => Self {
                can_spawn: false,
                denial: Some(denial),
            },
        }
    }

    /// Human-readable reason, empty when the spawn is allowed.
    pub fn reason(&self) -> String {
        self.denial
            .as_ref()
            .map(|d| d.to_string())
            .unwrap_or_default()
    }
}

#[derive(Debug, Default)]
struct GovernorState {
    active_total: usize,
    per_project: HashMap<String, usize>,
    workers_per_dispatcher: HashMap<Uuid, usize>,
    dispatchers_per_project: HashMap<String, usize>,
    recent_spawns: VecDeque<Instant>,
    last_spawn: Option<Instant>,
}

impl GovernorState {
    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.recent_spawns.front() {
            if now.saturating_duration_since(*front) >= ONE_MINUTE {
                self.recent_spawns.pop_front();
            } else {
                break;
            }
        }
    }

    fn check_throttle(&self, policy: &SwarmPolicy, now: Instant) -> Result<(), SpawnDenial> {
        let throttling = &policy.throttling;
        if !throttling.enabled {
            return Ok(());
        }

        if let Some(last) = self.last_spawn {
            let since = now.saturating_duration_since(last);
            let min_interval = throttling.min_spawn_interval();
            if since < min_interval {
                return Err(SpawnDenial::Throttled {
                    retry_after: min_interval - since,
                });
            }
        }

        let per_second = throttling.max_spawns_per_second as usize;
        let in_last_second: Vec<&Instant> = self
            .recent_spawns
            .iter()
            .filter(|t| now.saturating_duration_since(**t) < ONE_SECOND)
            .collect();
        if in_last_second.len() >= per_second {
            if let Some(oldest) = in_last_second.first() {
                let elapsed = now.saturating_duration_since(**oldest);
                return Err(SpawnDenial::Throttled {
                    retry_after: ONE_SECOND.saturating_sub(elapsed),
                });
            }
        }

        if self.recent_spawns.len() >= throttling.max_spawns_per_minute as usize {
            if let Some(oldest) = self.recent_spawns.front() {
                let elapsed = now.saturating_duration_since(*oldest);
                return Err(SpawnDenial::Throttled {
                    retry_after: ONE_MINUTE.saturating_sub(elapsed),
                });
            }
        }

        Ok(())
    }

    fn check(
        &self,
        policy: &SwarmPolicy,
        agent_type: AgentType,
        project_id: &str,
        dispatcher_id: Option<Uuid>,
        now: Instant,
    ) -> Result<(), SpawnDenial> {
        let limits = &policy.limits;

        if self.active_total >= limits.max_concurrent_agents {
            return Err(SpawnDenial::GlobalCeiling {
                active: self.active_total,
                limit: limits.max_concurrent_agents,
            });
        }

        let project_active = self.per_project.get(project_id).copied().unwrap_or(0);
        if project_active >= limits.max_agents_per_project {
            return Err(SpawnDenial::ProjectCeiling {
                project_id: project_id.to_string(),
                active: project_active,
                limit: limits.max_agents_per_project,
            });
        }

        match agent_type {
            AgentType::CodeUnitDispatcher => {
                let active = self
                    .dispatchers_per_project
                    .get(project_id)
                    .copied()
                    .unwrap_or(0);
                if active >= limits.max_dispatchers_per_project {
                    return Err(SpawnDenial::DispatcherCeiling {
                        active,
                        limit: limits.max_dispatchers_per_project,
                    });
                }
                // Dispatchers are not rate limited.
                Ok(())
            }
            AgentType::FunctionWorker | AgentType::Builder => {
                if let Some(id) = dispatcher_id {
                    let active = self.workers_per_dispatcher.get(&id).copied().unwrap_or(0);
                    if active >= limits.max_workers_per_dispatcher {
                        return Err(SpawnDenial::DispatcherCeiling {
                            active,
                            limit: limits.max_workers_per_dispatcher,
                        });
                    }
                }
                self.check_throttle(policy, now)
            }
        }
    }

    fn record(&mut self, agent_type: AgentType, project_id: &str, dispatcher_id: Option<Uuid>, now: Instant) {
        self.active_total += 1;
        *self.per_project.entry(project_id.to_string()).or_insert(0) += 1;
        match agent_type {
            AgentType::CodeUnitDispatcher => {
                *self
                    .dispatchers_per_project
                    .entry(project_id.to_string())
                    .or_insert(0) += 1;
            }
            AgentType::FunctionWorker | AgentType::Builder => {
                if let Some(id) = dispatcher_id {
                    *self.workers_per_dispatcher.entry(id).or_insert(0) += 1;
                }
                self.recent_spawns.push_back(now);
                self.last_spawn = Some(now);
            }
        }
    }

    fn release(&mut self, agent_type: AgentType, project_id: &str, dispatcher_id: Option<Uuid>) {
        self.active_total = self.active_total.saturating_sub(1);
        decrement(&mut self.per_project, project_id);
        match agent_type {
            AgentType::CodeUnitDispatcher => decrement(&mut self.dispatchers_per_project, project_id),
            AgentType::FunctionWorker | AgentType::Builder => {
                if let Some(id) = dispatcher_id {
                    if let Some(count) = self.workers_per_dispatcher.get_mut(&id) {
                        *count = count.saturating_sub(1);
                        if *count == 0 {
                            self.workers_per_dispatcher.remove(&id);
                        }
                    }
                }
            }
        }
    }
}

fn decrement(map: &mut HashMap<String, usize>, key: &str) {
    if let Some(count) = map.get_mut(key) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            map.remove(key);
        }
    }
}

/// Shared spawn bookkeeping for every dispatcher in the process.
#[derive(Debug, Clone)]
pub struct SpawnGovernor {
    policy: Arc<SwarmPolicy>,
    state: Arc<Mutex<GovernorState>>,
    metrics: MetricsCollector,
}

impl SpawnGovernor {
    pub fn new(policy: Arc<SwarmPolicy>) -> Self {
        Self {
            policy,
            state: Arc::new(Mutex::new(GovernorState::default())),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn policy(&self) -> &Arc<SwarmPolicy> {
        &self.policy
    }

    fn lock(&self) -> MutexGuard<'_, GovernorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Read-only check: would a spawn be allowed right now?
    pub fn check_spawn_capacity(
        &self,
        agent_type: AgentType,
        project_id: &str,
        dispatcher_id: Option<Uuid>,
    ) -> SpawnDecision {
        let now = Instant::now();
        let mut state = self.lock();
        state.prune(now);
        SpawnDecision::from_check(state.check(&self.policy, agent_type, project_id, dispatcher_id, now))
    }

    /// Checks capacity and, when allowed, records the spawn atomically.
    ///
    /// The returned permit holds the slot until it is dropped.
    pub fn try_reserve(
        &self,
        agent_type: AgentType,
        project_id: &str,
        dispatcher_id: Option<Uuid>,
    ) -> Result<SpawnPermit, SpawnDenial> {
        let now = Instant::now();
        let result = {
            let mut state = self.lock();
            state.prune(now);
            state
                .check(&self.policy, agent_type, project_id, dispatcher_id, now)
                .map(|()| state.record(agent_type, project_id, dispatcher_id, now))
        };

        match result {
            Ok(()) => {
                self.metrics.record_spawn_decision("spawned");
                Ok(SpawnPermit {
                    state: Arc::clone(&self.state),
                    agent_type,
                    project_id: project_id.to_string(),
                    dispatcher_id,
                })
            }
            Err(denial) => {
                let outcome = if denial.is_throttled() { "throttled" } else { "denied" };
                self.metrics.record_spawn_decision(outcome);
                tracing::debug!(
                    agent_type = %agent_type,
                    project_id = project_id,
                    reason = %denial,
                    "Spawn denied"
                );
                Err(denial)
            }
        }
    }

    pub fn active_agents(&self) -> usize {
        self.lock().active_total
    }

    pub fn active_for_project(&self, project_id: &str) -> usize {
        self.lock().per_project.get(project_id).copied().unwrap_or(0)
    }

    pub fn active_for_dispatcher(&self, dispatcher_id: Uuid) -> usize {
        self.lock()
            .workers_per_dispatcher
            .get(&dispatcher_id)
            .copied()
            .unwrap_or(0)
    }
}

/// A reserved agent slot, released on drop.
#[derive(Debug)]
pub struct SpawnPermit {
    state: Arc<Mutex<GovernorState>>,
    agent_type: AgentType,
    project_id: String,
    dispatcher_id: Option<Uuid>,
}

impl SpawnPermit {
    pub fn agent_type(&self) -> AgentType {
        self.agent_type
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }
}

impl Drop for SpawnPermit {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.release(self.agent_type, &self.project_id, self.dispatcher_id);
    }
}
