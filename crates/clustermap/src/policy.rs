// Copyright 2024 Blobmap Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Resource state policies
//!
//! A policy turns a stream of success/error observations about one resource
//! into a binary up/down signal:
//!
//! ```text
//! Up --(threshold errors)--> Down --(backoff elapsed)--> ProbeEligible
//!  ^                                                       |      |
//!  +---------------------(success)-------------------------+      |
//!                         Down <--(error, clock reset)------------+
//! ```
//!
//! `ProbeEligible` is reported as up. Backoff expiry is computed when
//! [`ResourceStatePolicy::is_down`] is called; nothing is scheduled.

use crate::clock::Clock;
use crate::config::{ClusterMapConfig, FIXED_BACKOFF_POLICY_FACTORY, PolicyParams};
use crate::error::{ClusterMapError, Result};
use crate::types::ResourceKind;
use chrono::{DateTime, TimeDelta, Utc};
use hashbrown::HashMap;
use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Point-in-time view of a policy's internal counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyStatus {
    pub consecutive_errors: u32,
    pub last_error_at: Option<DateTime<Utc>>,
    pub hard_down: bool,
    pub down: bool,
}

/// Decides whether a resource is usable from observed outcomes.
///
/// Implementations must keep every method non-blocking and make concurrent
/// calls on the same instance linearizable.
pub trait ResourceStatePolicy: Send + Sync + fmt::Debug {
    /// Record a successful operation
    fn on_success(&self);

    /// Record a failed operation
    fn on_error(&self);

    /// Mark the resource down until [`on_hard_up`](Self::on_hard_up)
    fn on_hard_down(&self);

    /// Clear a previous hard down
    fn on_hard_up(&self);

    fn is_down(&self) -> bool;

    fn is_hard_down(&self) -> bool;

    fn status(&self) -> PolicyStatus;
}

#[derive(Debug, Default)]
struct FixedBackoffState {
    consecutive_errors: u32,
    last_error_at: Option<DateTime<Utc>>,
    hard_down: bool,
}

/// Fixed error threshold with a fixed retry backoff
#[derive(Debug)]
pub struct FixedBackoffPolicy {
    resource: String,
    kind: ResourceKind,
    threshold: u32,
    backoff: TimeDelta,
    clock: Arc<dyn Clock>,
    state: Mutex<FixedBackoffState>,
}

impl FixedBackoffPolicy {
    pub fn new(resource: impl Into<String>, kind: ResourceKind, params: PolicyParams, clock: Arc<dyn Clock>) -> Self {
        Self {
            resource: resource.into(),
            kind,
            threshold: params.error_threshold.max(1),
            backoff: TimeDelta::from_std(params.retry_backoff).unwrap_or(TimeDelta::MAX),
            clock,
            state: Mutex::new(FixedBackoffState::default()),
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    fn soft_down(&self, state: &FixedBackoffState, now: DateTime<Utc>) -> bool {
        if state.consecutive_errors < self.threshold {
            return false;
        }
        match state.last_error_at {
            Some(last) => now - last < self.backoff,
            None => false,
        }
    }
}

impl ResourceStatePolicy for FixedBackoffPolicy {
    fn on_success(&self) {
        let mut state = self.state.lock();
        if state.consecutive_errors >= self.threshold {
            info!(
                resource = %self.resource,
                kind = %self.kind,
                errors = state.consecutive_errors,
                "Resource recovered"
            );
            counter!("blobmap_clustermap_resource_recovered_total", "kind" => self.kind.as_str()).increment(1);
        }
        state.consecutive_errors = 0;
    }

    fn on_error(&self) {
        // The clock is read under the lock so error timestamps never go backwards.
        let mut state = self.state.lock();
        let now = self.clock.now();
        state.consecutive_errors = state.consecutive_errors.saturating_add(1);
        state.last_error_at = Some(state.last_error_at.map_or(now, |last| last.max(now)));

        if state.consecutive_errors == self.threshold {
            warn!(
                resource = %self.resource,
                kind = %self.kind,
                threshold = self.threshold,
                backoff_ms = self.backoff.num_milliseconds(),
                "Resource marked down"
            );
            counter!("blobmap_clustermap_resource_down_total", "kind" => self.kind.as_str()).increment(1);
        } else {
            debug!(
                resource = %self.resource,
                kind = %self.kind,
                errors = state.consecutive_errors,
                "Resource error recorded"
            );
        }
    }

    fn on_hard_down(&self) {
        let mut state = self.state.lock();
        if !state.hard_down {
            warn!(resource = %self.resource, kind = %self.kind, "Resource hard down");
        }
        state.hard_down = true;
    }

    fn on_hard_up(&self) {
        let mut state = self.state.lock();
        if state.hard_down {
            info!(resource = %self.resource, kind = %self.kind, "Resource hard up");
        }
        state.hard_down = false;
    }

    fn is_down(&self) -> bool {
        let now = self.clock.now();
        let state = self.state.lock();
        state.hard_down || self.soft_down(&state, now)
    }

    fn is_hard_down(&self) -> bool {
        self.state.lock().hard_down
    }

    fn status(&self) -> PolicyStatus {
        let now = self.clock.now();
        let state = self.state.lock();
        PolicyStatus {
            consecutive_errors: state.consecutive_errors,
            last_error_at: state.last_error_at,
            hard_down: state.hard_down,
            down: state.hard_down || self.soft_down(&state, now),
        }
    }
}

/// Creates one policy instance per resource
pub trait ResourceStatePolicyFactory: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// `resource` is a human readable name used in logs
    fn create(&self, kind: ResourceKind, resource: &str) -> Arc<dyn ResourceStatePolicy>;
}

/// Factory for [`FixedBackoffPolicy`] with per-kind parameters
#[derive(Debug)]
pub struct FixedBackoffPolicyFactory {
    datanode: PolicyParams,
    disk: PolicyParams,
    replica: PolicyParams,
    clock: Arc<dyn Clock>,
}

impl FixedBackoffPolicyFactory {
    pub fn new(config: &ClusterMapConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            datanode: config.policy_params(ResourceKind::DataNode),
            disk: config.policy_params(ResourceKind::Disk),
            replica: config.policy_params(ResourceKind::Replica),
            clock,
        }
    }

    pub fn params(&self, kind: ResourceKind) -> PolicyParams {
        match kind {
            ResourceKind::DataNode => self.datanode,
            ResourceKind::Disk => self.disk,
            ResourceKind::Replica => self.replica,
        }
    }
}

impl ResourceStatePolicyFactory for FixedBackoffPolicyFactory {
    fn name(&self) -> &str {
        FIXED_BACKOFF_POLICY_FACTORY
    }

    fn create(&self, kind: ResourceKind, resource: &str) -> Arc<dyn ResourceStatePolicy> {
        Arc::new(FixedBackoffPolicy::new(resource, kind, self.params(kind), Arc::clone(&self.clock)))
    }
}

/// Constructor registered under a factory name
pub type PolicyFactoryConstructor = fn(&ClusterMapConfig, Arc<dyn Clock>) -> Result<Arc<dyn ResourceStatePolicyFactory>>;

fn fixed_backoff_factory(config: &ClusterMapConfig, clock: Arc<dyn Clock>) -> Result<Arc<dyn ResourceStatePolicyFactory>> {
    Ok(Arc::new(FixedBackoffPolicyFactory::new(config, clock)))
}

/// Name-indexed set of policy factory constructors.
///
/// The configured `resource_state_policy_factory` is looked up here at
/// startup, so a different decision function can be plugged in without
/// touching any caller.
#[derive(Clone)]
pub struct PolicyFactoryRegistry {
    constructors: HashMap<String, PolicyFactoryConstructor>,
}

impl PolicyFactoryRegistry {
    /// Registry without any factory
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, constructor: PolicyFactoryConstructor) -> &mut Self {
        self.constructors.insert(name.into(), constructor);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    /// Instantiate the factory named by the configuration
    pub fn create(&self, config: &ClusterMapConfig, clock: Arc<dyn Clock>) -> Result<Arc<dyn ResourceStatePolicyFactory>> {
        let name = config.resource_state_policy_factory.as_str();
        let constructor = self.constructors.get(name).ok_or_else(|| {
            let mut known: Vec<_> = self.constructors.keys().map(String::as_str).collect();
            known.sort_unstable();
            ClusterMapError::invalid_config(format!(
                "unknown resource state policy factory {name} (known: {})",
                known.join(", ")
            ))
        })?;
        info!(factory = %name, "Creating resource state policy factory");
        constructor(config, clock)
    }
}

impl Default for PolicyFactoryRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(FIXED_BACKOFF_POLICY_FACTORY, fixed_backoff_factory);
        registry
    }
}

impl fmt::Debug for PolicyFactoryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.constructors.keys().collect();
        names.sort_unstable();
        f.debug_struct("PolicyFactoryRegistry").field("factories", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    const MINUTE: Duration = Duration::from_secs(60);

    fn policy(threshold: u32, backoff: Duration) -> (Arc<ManualClock>, FixedBackoffPolicy) {
        let clock = Arc::new(ManualClock::starting_now());
        let params = PolicyParams {
            error_threshold: threshold,
            retry_backoff: backoff,
        };
        let policy = FixedBackoffPolicy::new("r1", ResourceKind::Replica, params, clock.clone());
        (clock, policy)
    }

    #[test]
    fn test_initially_up() {
        let (_, policy) = policy(3, MINUTE);
        assert!(!policy.is_down());
        assert_eq!(policy.status().consecutive_errors, 0);
    }

    #[test]
    fn test_down_after_exactly_threshold_errors() {
        let (_, policy) = policy(3, MINUTE);

        policy.on_error();
        policy.on_error();
        assert!(!policy.is_down());

        policy.on_error();
        assert!(policy.is_down());
    }

    #[test]
    fn test_success_resets_counter() {
        let (_, policy) = policy(3, MINUTE);
        for _ in 0..5 {
            policy.on_error();
        }
        assert!(policy.is_down());

        policy.on_success();
        assert!(!policy.is_down());
        assert_eq!(policy.status().consecutive_errors, 0);

        policy.on_error();
        policy.on_error();
        assert!(!policy.is_down());
    }

    #[test]
    fn test_probe_eligible_after_backoff() {
        let (clock, policy) = policy(1, 10 * MINUTE);

        policy.on_error();
        assert!(policy.is_down());

        clock.advance(9 * MINUTE);
        assert!(policy.is_down());

        clock.advance(MINUTE);
        assert!(!policy.is_down());
        // counter survives until the next observation resolves the probe
        assert_eq!(policy.status().consecutive_errors, 1);

        policy.on_error();
        assert!(policy.is_down());

        clock.advance(9 * MINUTE);
        assert!(policy.is_down());
    }

    #[test]
    fn test_probe_success_marks_up() {
        let (clock, policy) = policy(2, MINUTE);
        policy.on_error();
        policy.on_error();
        clock.advance(MINUTE);
        assert!(!policy.is_down());

        policy.on_success();
        clock.advance(Duration::from_secs(1));
        policy.on_error();
        assert!(!policy.is_down());
    }

    #[test]
    fn test_hard_down_ignores_backoff() {
        let (clock, policy) = policy(1, MINUTE);
        policy.on_hard_down();
        assert!(policy.is_down());
        assert!(policy.is_hard_down());

        clock.advance(10 * MINUTE);
        policy.on_success();
        assert!(policy.is_down());

        policy.on_hard_up();
        assert!(!policy.is_down());
    }

    #[test]
    fn test_concurrent_errors_are_not_lost() {
        let (_, policy) = policy(u32::MAX, MINUTE);
        let policy = Arc::new(policy);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let policy = Arc::clone(&policy);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        policy.on_error();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let status = policy.status();
        assert_eq!(status.consecutive_errors, 8000);
        assert!(status.last_error_at.is_some());
    }

    /// First `now()` call parks until released; later calls are 60s ahead.
    #[derive(Debug)]
    struct StallingClock {
        start: DateTime<Utc>,
        calls: AtomicUsize,
        entered: Barrier,
        release: Barrier,
    }

    impl Clock for StallingClock {
        fn now(&self) -> DateTime<Utc> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                self.entered.wait();
                self.release.wait();
                self.start
            } else {
                self.start + TimeDelta::seconds(60)
            }
        }
    }

    #[test]
    fn test_last_error_time_never_moves_backwards() {
        let clock = Arc::new(StallingClock {
            start: Utc::now(),
            calls: AtomicUsize::new(0),
            entered: Barrier::new(2),
            release: Barrier::new(2),
        });
        let params = PolicyParams {
            error_threshold: 1,
            retry_backoff: 2 * MINUTE,
        };
        let policy = Arc::new(FixedBackoffPolicy::new("r1", ResourceKind::Disk, params, clock.clone()));

        let slow = {
            let policy = Arc::clone(&policy);
            thread::spawn(move || policy.on_error())
        };
        clock.entered.wait();

        let fast = {
            let policy = Arc::clone(&policy);
            thread::spawn(move || policy.on_error())
        };
        thread::sleep(Duration::from_millis(50));
        clock.release.wait();

        slow.join().unwrap();
        fast.join().unwrap();

        let status = policy.status();
        assert_eq!(status.consecutive_errors, 2);
        assert_eq!(status.last_error_at, Some(clock.start + TimeDelta::seconds(60)));
    }

    #[test]
    fn test_registry_selects_by_name() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::starting_now());
        let config = ClusterMapConfig::new("blobs", "dc1", "h1");

        let factory = PolicyFactoryRegistry::default().create(&config, clock.clone()).unwrap();
        assert_eq!(factory.name(), FIXED_BACKOFF_POLICY_FACTORY);

        let mut unknown = config.clone();
        unknown.resource_state_policy_factory = "adaptive".into();
        let err = PolicyFactoryRegistry::default().create(&unknown, clock).unwrap_err();
        assert!(err.is_configuration_error());
    }

    #[derive(Debug)]
    struct NeverDown;

    impl ResourceStatePolicy for NeverDown {
        fn on_success(&self) {}
        fn on_error(&self) {}
        fn on_hard_down(&self) {}
        fn on_hard_up(&self) {}
        fn is_down(&self) -> bool {
            false
        }
        fn is_hard_down(&self) -> bool {
            false
        }
        fn status(&self) -> PolicyStatus {
            PolicyStatus {
                consecutive_errors: 0,
                last_error_at: None,
                hard_down: false,
                down: false,
            }
        }
    }

    #[derive(Debug)]
    struct NeverDownFactory;

    impl ResourceStatePolicyFactory for NeverDownFactory {
        fn name(&self) -> &str {
            "never-down"
        }

        fn create(&self, _kind: ResourceKind, _resource: &str) -> Arc<dyn ResourceStatePolicy> {
            Arc::new(NeverDown)
        }
    }

    #[test]
    fn test_registry_accepts_custom_factory() {
        let mut registry = PolicyFactoryRegistry::default();
        registry.register("never-down", |_, _| Ok(Arc::new(NeverDownFactory)));
        assert!(registry.contains("never-down"));

        let mut config = ClusterMapConfig::new("blobs", "dc1", "h1");
        config.resource_state_policy_factory = "never-down".into();
        let factory = registry.create(&config, Arc::new(ManualClock::starting_now())).unwrap();

        let policy = factory.create(ResourceKind::Disk, "h1:7000/mnt0");
        policy.on_error();
        assert!(!policy.is_down());
    }
}
