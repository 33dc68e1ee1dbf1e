//! Polling a cloud resource until it reaches a target state.
//!
//! Every resource these tools create (instances, images, compute environments, job queues) follows the same lifecycle:
//! a single creation request, then repeated describe calls at a fixed interval until the provider reports the state we want.
//! [`await_state`] is that loop. It always has a deadline, so a stuck resource produces [`LifecycleError::TimedOut`]
//! instead of blocking forever.

use std::collections::BTreeMap;
use std::fmt::{Debug, Display};
use std::future::Future;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// The status enum of one kind of resource.
pub trait ResourceStatus: Clone + PartialEq + Debug + Display + Send {
    /// Returns true for states the resource can never leave for the state being waited on.
    fn is_failure(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDescriptor<S> {
    /// Opaque identifier issued by the provider
    pub id: String,
    pub status: S,
    /// The provider's explanation of the current status, if it gave one.
    pub reason: Option<String>,
    /// Public address for resources that can be connected to.
    pub endpoint: Option<IpAddr>,
    pub tags: BTreeMap<String, String>,
}

impl<S> ResourceDescriptor<S> {
    pub fn new(id: impl Into<String>, status: S) -> Self {
        ResourceDescriptor {
            id: id.into(),
            status,
            reason: None,
            endpoint: None,
            tags: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WaitConfig {
    /// Fixed delay between status queries
    pub poll_interval: Duration,
    /// Maximum total time to wait before giving up
    pub timeout: Duration,
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Timed out after {timeout:?} waiting for {resource} to become {target}, it was last {last}")]
    TimedOut {
        resource: String,
        target: String,
        last: String,
        timeout: Duration,
    },
    #[error("{resource} entered state {status} while waiting for it to become {target}{}", .reason.as_ref().map(|x| format!(": {x}")).unwrap_or_default())]
    FailedState {
        resource: String,
        target: String,
        status: String,
        reason: Option<String>,
    },
    #[error("{resource} no longer exists")]
    Vanished { resource: String },
    #[error("Failed to query the status of {resource}")]
    Describe {
        resource: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Repeatedly calls `describe` every `wait.poll_interval` until the resource reaches `target`.
///
/// `describe` returns `Ok(None)` when the provider no longer knows about the resource.
/// The deadline is checked after each query so at least one query is always made.
pub async fn await_state<S, F, Fut>(
    resource: &str,
    target: &S,
    wait: &WaitConfig,
    mut describe: F,
) -> Result<ResourceDescriptor<S>, LifecycleError>
where
    S: ResourceStatus,
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<Option<ResourceDescriptor<S>>>>,
{
    let start = Instant::now();
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let descriptor = match describe().await {
            Ok(Some(descriptor)) => descriptor,
            Ok(None) => {
                return Err(LifecycleError::Vanished {
                    resource: resource.to_owned(),
                })
            }
            Err(source) => {
                return Err(LifecycleError::Describe {
                    resource: resource.to_owned(),
                    source,
                })
            }
        };

        if &descriptor.status == target {
            tracing::debug!(resource, attempts, status = %descriptor.status, "resource reached target state");
            return Ok(descriptor);
        }
        if descriptor.status.is_failure() {
            return Err(LifecycleError::FailedState {
                resource: resource.to_owned(),
                target: target.to_string(),
                status: descriptor.status.to_string(),
                reason: descriptor.reason,
            });
        }
        if start.elapsed() + wait.poll_interval > wait.timeout {
            return Err(LifecycleError::TimedOut {
                resource: resource.to_owned(),
                target: target.to_string(),
                last: descriptor.status.to_string(),
                timeout: wait.timeout,
            });
        }

        tracing::info!(
            "Waiting for {resource} to become {target}, currently {}",
            descriptor.status
        );
        tokio::time::sleep(wait.poll_interval).await;
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) enum Light {
        Red,
        Amber,
        Green,
        Broken,
    }

    impl Display for Light {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", format!("{self:?}").to_lowercase())
        }
    }

    impl ResourceStatus for Light {
        fn is_failure(&self) -> bool {
            matches!(self, Light::Broken)
        }
    }

    pub(crate) fn fast_wait() -> WaitConfig {
        WaitConfig {
            poll_interval: Duration::from_millis(5),
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn reaches_target_after_polling() {
        let calls = AtomicU32::new(0);
        let result = await_state("light-1", &Light::Green, &fast_wait(), || {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                let status = match call {
                    0 => Light::Red,
                    1 => Light::Amber,
                    _ => Light::Green,
                };
                Ok(Some(ResourceDescriptor::new("light-1", status)))
            }
        })
        .await
        .unwrap();

        assert_eq!(result.status, Light::Green);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn times_out() {
        let wait = WaitConfig {
            poll_interval: Duration::from_millis(10),
            timeout: Duration::from_millis(50),
        };
        let err = await_state("light-1", &Light::Green, &wait, || async {
            Ok(Some(ResourceDescriptor::new("light-1", Light::Red)))
        })
        .await
        .unwrap_err();

        match err {
            LifecycleError::TimedOut { last, target, .. } => {
                assert_eq!(last, "red");
                assert_eq!(target, "green");
            }
            err => panic!("unexpected error {err:?}"),
        }
    }

    #[tokio::test]
    async fn failure_state_reported_with_reason() {
        let err = await_state("light-1", &Light::Green, &fast_wait(), || async {
            let mut descriptor = ResourceDescriptor::new("light-1", Light::Broken);
            descriptor.reason = Some("bulb blown".to_owned());
            Ok(Some(descriptor))
        })
        .await
        .unwrap_err();

        assert_eq!(
            err.to_string(),
            "light-1 entered state broken while waiting for it to become green: bulb blown"
        );
    }

    #[tokio::test]
    async fn failure_state_can_be_the_target() {
        let result = await_state("light-1", &Light::Broken, &fast_wait(), || async {
            Ok(Some(ResourceDescriptor::new("light-1", Light::Broken)))
        })
        .await
        .unwrap();
        assert_eq!(result.status, Light::Broken);
    }

    #[tokio::test]
    async fn vanished() {
        let err = await_state::<Light, _, _>("light-1", &Light::Green, &fast_wait(), || async {
            Ok(None)
        })
        .await
        .unwrap_err();
        assert!(matches!(err, LifecycleError::Vanished { .. }));
    }

    #[tokio::test]
    async fn describe_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let err = await_state::<Light, _, _>("light-1", &Light::Green, &fast_wait(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(anyhow::anyhow!("AccessDenied")) }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.to_string(), "Failed to query the status of light-1");
    }
}
