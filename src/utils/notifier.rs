use std::time::Duration;

use async_trait::async_trait;
use log::{error, info, warn};

use crate::errors::{DeliveryError, NotifyError};
use crate::shutdown::Shutdown;

/// One way of getting a message to the student (mail, chat bot, ...).
///
/// Implementations classify their own failures: only `Transient` is retried. A channel that
/// reports an error while signalling the message was in fact accepted should return `Ok`.
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    fn name(&self) -> &'static str;

    async fn deliver(&self, title: &str, content: &str) -> Result<(), DeliveryError>;
}

pub struct Notifier {
    channel: Option<Box<dyn DeliveryChannel>>,
    max_retries: u32,
    retry_delay: Duration,
    shutdown: Shutdown,
}

impl Notifier {
    /// Delivery switched off: every notification is only logged.
    pub fn disabled() -> Self {
        Self { channel: None, max_retries: 1, retry_delay: Duration::ZERO, shutdown: Shutdown::never() }
    }

    pub fn new(channel: Box<dyn DeliveryChannel>, max_retries: u32, retry_delay: Duration, shutdown: Shutdown) -> Self {
        Self { channel: Some(channel), max_retries: max_retries.max(1), retry_delay, shutdown }
    }

    pub fn is_enabled(&self) -> bool {
        self.channel.is_some()
    }

    pub async fn notify(&self, title: &str, content: &str) -> Result<(), NotifyError> {
        let Some(channel) = &self.channel else {
            info!("Notification (delivery disabled): {title}\n{content}");
            return Ok(());
        };

        let mut last = None;
        for attempt in 1..=self.max_retries {
            match channel.deliver(title, content).await {
                Ok(()) => {
                    info!("Notification sent via {} on attempt {attempt}", channel.name());
                    return Ok(());
                }
                Err(DeliveryError::Transient(reason)) => {
                    warn!("{} delivery attempt {attempt}/{} failed: {reason}", channel.name(), self.max_retries);
                    last = Some(DeliveryError::Transient(reason));
                }
                Err(e) => {
                    error!("{} delivery failed, not retrying: {e}", channel.name());
                    return Err(NotifyError::Aborted(e));
                }
            }

            if attempt < self.max_retries && !self.shutdown.sleep(self.retry_delay).await {
                return Err(NotifyError::Interrupted(self.retry_delay));
            }
        }

        let last = last.unwrap_or_else(|| DeliveryError::Transient("no attempt made".into()));
        error!("Giving up on notification after {} attempts", self.max_retries);
        Err(NotifyError::Exhausted { attempts: self.max_retries, last })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::shutdown;

    /// Scripted channel: plays back `script` in order, then repeats the last entry.
    pub(crate) struct ScriptedChannel {
        script: Vec<Result<(), DeliveryError>>,
        pub(crate) attempts: Arc<AtomicU32>,
        pub(crate) delivered: Arc<Mutex<Vec<(String, String)>>>,
    }

    impl ScriptedChannel {
        pub(crate) fn new(script: Vec<Result<(), DeliveryError>>) -> Self {
            Self { script, attempts: Arc::default(), delivered: Arc::default() }
        }
    }

    #[async_trait]
    impl DeliveryChannel for ScriptedChannel {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn deliver(&self, title: &str, content: &str) -> Result<(), DeliveryError> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst) as usize;
            let outcome = self.script.get(n).or(self.script.last()).cloned().unwrap_or(Ok(()));
            if outcome.is_ok() {
                self.delivered.lock().unwrap().push((title.to_string(), content.to_string()));
            }
            outcome
        }
    }

    fn transient() -> Result<(), DeliveryError> {
        Err(DeliveryError::Transient("connection reset".into()))
    }

    #[tokio::test]
    async fn disabled_notifier_always_succeeds() {
        let notifier = Notifier::disabled();
        assert!(!notifier.is_enabled());
        assert!(notifier.notify("1 new grade(s): Math", "body").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_until_success() {
        let channel = ScriptedChannel::new(vec![transient(), transient(), Ok(())]);
        let attempts = channel.attempts.clone();
        let notifier = Notifier::new(Box::new(channel), 3, Duration::from_secs(5), Shutdown::never());
        notifier.notify("t", "c").await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_reports_failure_after_exactly_max_retries() {
        let channel = ScriptedChannel::new(vec![transient()]);
        let attempts = channel.attempts.clone();
        let notifier = Notifier::new(Box::new(channel), 3, Duration::from_secs(5), Shutdown::never());
        let err = notifier.notify("t", "c").await.unwrap_err();
        assert!(matches!(err, NotifyError::Exhausted { attempts: 3, .. }));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn auth_failure_is_not_retried() {
        let channel = ScriptedChannel::new(vec![Err(DeliveryError::Auth("535 bad credentials".into()))]);
        let attempts = channel.attempts.clone();
        let notifier = Notifier::new(Box::new(channel), 3, Duration::ZERO, Shutdown::never());
        let err = notifier.notify("t", "c").await.unwrap_err();
        assert!(matches!(err, NotifyError::Aborted(DeliveryError::Auth(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_interrupts_retry_wait() {
        let (trigger, signal) = shutdown::channel();
        trigger.trigger();
        let channel = ScriptedChannel::new(vec![transient()]);
        let attempts = channel.attempts.clone();
        let notifier = Notifier::new(Box::new(channel), 3, Duration::from_secs(3600), signal);
        let err = notifier.notify("t", "c").await.unwrap_err();
        assert!(matches!(err, NotifyError::Interrupted(_)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
