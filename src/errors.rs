use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    /// The portal answered and refused the credentials.
    #[error("portal rejected login: {0}")]
    Rejected(String),
    #[error("login request failed: {0}")]
    Transport(String),
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("portal session expired")]
    SessionExpired,
    #[error("grade request failed: {0}")]
    Transport(String),
    #[error("unexpected grade response: {0}")]
    Malformed(String),
    #[error("term navigation failed: {0}")]
    Navigation(#[from] NavigationError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NavigationError {
    #[error("target term not reached after {0} steps")]
    StepLimit(usize),
    #[error("no {0} control available on the grade page")]
    Unreachable(&'static str),
    #[error("navigation step left the page on {0}")]
    Stalled(String),
    #[error("cannot read term label {0:?}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("baseline file I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("baseline file is not valid CSV: {0}")]
    Csv(#[from] csv::Error),
}

/// How a single delivery attempt failed. Decides whether the notifier retries.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("transient delivery failure: {0}")]
    Transient(String),
    #[error("delivery channel refused credentials: {0}")]
    Auth(String),
    #[error("delivery channel rejected the message: {0}")]
    Rejected(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NotifyError {
    #[error("notification not delivered after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: DeliveryError },
    #[error("notification not delivered: {0}")]
    Aborted(DeliveryError),
    #[error("shutdown requested while waiting {0:?} to retry")]
    Interrupted(Duration),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{0} is invalid: {1}")]
    Invalid(&'static str, String),
}
