use super::{ChildPicker, ChildPolicyGroup, ConnectivityState, PickInfo, PickResult};
use crate::config::ChildPolicyConfig;
use crate::error::{PickError, RlsError};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Snapshot of a child policy as seen by pickers
#[derive(Clone)]
pub struct ChildPolicyState {
    pub connectivity: ConnectivityState,
    pub picker: Arc<dyn ChildPicker>,
}

impl fmt::Debug for ChildPolicyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildPolicyState")
            .field("connectivity", &self.connectivity)
            .finish()
    }
}

/// Queues every pick until the child produces a real picker
#[derive(Debug, Default)]
pub struct QueuePicker;

impl ChildPicker for QueuePicker {
    fn pick(&self, _info: &PickInfo) -> Result<PickResult, PickError> {
        Err(PickError::Queue)
    }
}

/// Fails every pick with a fixed error
#[derive(Debug)]
pub struct ErrorPicker {
    error: RlsError,
}

impl ErrorPicker {
    pub fn new(error: RlsError) -> Self {
        Self { error }
    }
}

impl ChildPicker for ErrorPicker {
    fn pick(&self, _info: &PickInfo) -> Result<PickResult, PickError> {
        Err(PickError::Failed(self.error.clone()))
    }
}

/// Shared handle to the child policy of one target.
///
/// The reference count tracks how many cache entries (plus the default
/// target slot) point at the wrapper; it is only modified under the
/// registry lock.
pub struct ChildPolicyWrapper {
    target: String,
    ref_count: AtomicUsize,
    state: ArcSwap<ChildPolicyState>,
}

impl ChildPolicyWrapper {
    fn new(target: String) -> Self {
        Self {
            target,
            ref_count: AtomicUsize::new(1),
            state: ArcSwap::from_pointee(ChildPolicyState {
                connectivity: ConnectivityState::Idle,
                picker: Arc::new(QueuePicker),
            }),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Lock-free snapshot of the child's state
    pub fn state(&self) -> Arc<ChildPolicyState> {
        self.state.load_full()
    }

    pub fn connectivity(&self) -> ConnectivityState {
        self.state.load().connectivity
    }

    pub(crate) fn set_state(&self, state: ChildPolicyState) {
        self.state.store(Arc::new(state));
    }

    /// Force TRANSIENT_FAILURE with a picker failing every RPC with `err`
    pub fn lamify(&self, err: RlsError) {
        warn!(target = %self.target, error = %err, "Child policy moved to TRANSIENT_FAILURE");
        self.set_state(ChildPolicyState {
            connectivity: ConnectivityState::TransientFailure,
            picker: Arc::new(ErrorPicker::new(err)),
        });
    }
}

impl fmt::Debug for ChildPolicyWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildPolicyWrapper")
            .field("target", &self.target)
            .field("ref_count", &self.ref_count())
            .field("connectivity", &self.connectivity())
            .finish()
    }
}

#[derive(Debug, Clone)]
struct PolicySettings {
    policy: ChildPolicyConfig,
    target_field_name: String,
}

#[derive(Default)]
struct RegistryInner {
    children: HashMap<String, Arc<ChildPolicyWrapper>>,
    settings: Option<PolicySettings>,
}

/// Reference counted pool of child policies keyed by target.
///
/// Group calls are made with the internal map lock held, so the group sees
/// `add` and `remove` for a target in the same order as the registry.
pub struct ChildPolicyRegistry {
    group: Arc<dyn ChildPolicyGroup>,
    inner: Mutex<RegistryInner>,
}

impl ChildPolicyRegistry {
    pub fn new(group: Arc<dyn ChildPolicyGroup>) -> Self {
        Self {
            group,
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    /// Take one reference to each target, creating child policies for
    /// targets seen for the first time.
    ///
    /// Returns the wrappers in the order of `targets`.
    pub fn acquire_references(&self, targets: &[String]) -> Vec<Arc<ChildPolicyWrapper>> {
        let mut wrappers = Vec::with_capacity(targets.len());
        let mut inner = self.inner.lock();

        for target in targets {
            if let Some(existing) = inner.children.get(target) {
                existing.ref_count.fetch_add(1, Ordering::AcqRel);
                wrappers.push(Arc::clone(existing));
                continue;
            }

            let wrapper = Arc::new(ChildPolicyWrapper::new(target.clone()));
            inner.children.insert(target.clone(), Arc::clone(&wrapper));

            let name = inner
                .settings
                .as_ref()
                .map(|s| s.policy.name.as_str())
                .unwrap_or_default();
            debug!(target = %target, policy = %name, "Creating child policy");
            self.group.add(target, name);
            if let Some(settings) = &inner.settings {
                self.push_config(settings, &wrapper);
            }
            wrappers.push(wrapper);
        }

        wrappers
    }

    /// Drop one reference to each target; children without references are
    /// removed from the group.
    pub fn release_references(&self, targets: &[String]) {
        let mut inner = self.inner.lock();

        for target in targets {
            let Some(wrapper) = inner.children.get(target) else {
                warn!(target = %target, "Releasing unknown child policy");
                continue;
            };

            if wrapper.ref_count.fetch_sub(1, Ordering::AcqRel) == 1 {
                inner.children.remove(target);
                debug!(target = %target, "Removing child policy");
                self.group.remove(target);
            }
        }
    }

    /// Look up the wrapper for a target
    pub fn get(&self, target: &str) -> Option<Arc<ChildPolicyWrapper>> {
        self.inner.lock().children.get(target).cloned()
    }

    /// Number of live child policies
    pub fn len(&self) -> usize {
        self.inner.lock().children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().children.is_empty()
    }

    /// Store a state reported by a child. Returns false for unknown targets.
    pub fn update_state(
        &self,
        target: &str,
        connectivity: ConnectivityState,
        picker: Arc<dyn ChildPicker>,
    ) -> bool {
        let Some(wrapper) = self.get(target) else {
            debug!(target = %target, "Ignoring state update for unknown child policy");
            return false;
        };

        wrapper.set_state(ChildPolicyState {
            connectivity,
            picker,
        });
        true
    }

    /// Install a new child policy configuration and push it to every child.
    ///
    /// A change of policy name replaces every existing child. Returns whether
    /// the name changed.
    pub fn update_policy(&self, policy: ChildPolicyConfig, target_field_name: String) -> bool {
        let settings = PolicySettings {
            policy,
            target_field_name,
        };

        let mut inner = self.inner.lock();
        let name_changed = inner
            .settings
            .as_ref()
            .is_some_and(|old| old.policy.name != settings.policy.name);
        inner.settings = Some(settings.clone());

        if name_changed {
            info!(
                policy = %settings.policy.name,
                children = inner.children.len(),
                "Child policy changed, rebuilding children"
            );
            for wrapper in inner.children.values() {
                self.group.remove(&wrapper.target);
                wrapper.set_state(ChildPolicyState {
                    connectivity: ConnectivityState::Idle,
                    picker: Arc::new(QueuePicker),
                });
                self.group.add(&wrapper.target, &settings.policy.name);
            }
        }

        for wrapper in inner.children.values() {
            self.push_config(&settings, wrapper);
        }

        name_changed
    }

    /// Aggregated connectivity of all children
    pub fn aggregated_state(&self) -> ConnectivityState {
        let states: Vec<ConnectivityState> = self
            .inner
            .lock()
            .children
            .values()
            .map(|w| w.connectivity())
            .collect();
        aggregate_states(&states)
    }

    fn push_config(&self, settings: &PolicySettings, wrapper: &ChildPolicyWrapper) {
        let result = settings
            .policy
            .build_for_target(&settings.target_field_name, &wrapper.target)
            .and_then(|config| self.group.update_config(&wrapper.target, &config));

        if let Err(e) = result {
            wrapper.lamify(e);
        }
    }
}

impl fmt::Debug for ChildPolicyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildPolicyRegistry")
            .field("children", &self.len())
            .finish()
    }
}

/// READY beats CONNECTING beats IDLE beats TRANSIENT_FAILURE. No children
/// at all is IDLE.
pub fn aggregate_states(states: &[ConnectivityState]) -> ConnectivityState {
    if states.is_empty() {
        return ConnectivityState::Idle;
    }

    let has = |wanted: ConnectivityState| states.iter().any(|s| *s == wanted);
    if has(ConnectivityState::Ready) {
        ConnectivityState::Ready
    } else if has(ConnectivityState::Connecting) {
        ConnectivityState::Connecting
    } else if has(ConnectivityState::Idle) {
        ConnectivityState::Idle
    } else {
        ConnectivityState::TransientFailure
    }
}
