use std::collections::{HashMap, HashSet};
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::errors::{AuthError, FetchError};
use crate::models::{CourseScore, Credentials, GradeSet, Session, TermQuery};
use crate::shutdown::Shutdown;
use crate::utils::baseline::BaselineStore;
use crate::utils::notifier::Notifier;
use crate::utils::portal::PortalClient;

/// Session state. Polling happens inside `LoggedIn`; any session failure drops back to `LoggedOut`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    LoggedOut,
    LoggedIn(Session),
}

/// What one poll cycle ended with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    LoginFailed,
    FetchFailed,
    /// Portal returned nothing while the baseline has courses; treated as a glitch.
    SkippedEmpty,
    Unchanged,
    Notified(Vec<String>),
    NotifyFailed,
}

/// Comparison of a fresh grade set with the baseline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GradeDiff {
    SkippedEmpty,
    Changes {
        /// Courses whose name is not in the baseline, in portal order.
        new: Vec<String>,
        /// Known courses whose score or credit changed.
        updated: Vec<String>,
    },
}

pub fn diff_grades(baseline: &GradeSet, current: &GradeSet) -> GradeDiff {
    if current.is_empty() && !baseline.is_empty() {
        return GradeDiff::SkippedEmpty;
    }
    let known: HashMap<&str, &CourseScore> = baseline.iter().map(|c| (c.name.as_str(), c)).collect();
    let mut seen = HashSet::new();
    let mut new = Vec::new();
    let mut updated = Vec::new();
    for course in current {
        if !seen.insert(course.name.as_str()) {
            continue;
        }
        match known.get(course.name.as_str()) {
            None => new.push(course.name.clone()),
            Some(previous) if *previous != course => updated.push(course.name.clone()),
            Some(_) => {}
        }
    }
    GradeDiff::Changes { new, updated }
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub poll_interval: Duration,
    /// Also notify when an already-announced course changes score or credit.
    pub notify_on_update: bool,
}

pub struct ScoreMonitor<P: PortalClient> {
    portal: P,
    credentials: Credentials,
    query: TermQuery,
    notifier: Notifier,
    store: BaselineStore,
    baseline: GradeSet,
    /// False while the in-memory baseline has not reached disk yet.
    persisted: bool,
    state: SessionState,
    settings: MonitorSettings,
}

impl<P: PortalClient> ScoreMonitor<P> {
    pub fn new(
        portal: P,
        credentials: Credentials,
        query: TermQuery,
        notifier: Notifier,
        store: BaselineStore,
        settings: MonitorSettings,
    ) -> Self {
        let baseline = store.load();
        Self {
            portal,
            credentials,
            query,
            notifier,
            store,
            baseline,
            persisted: true,
            state: SessionState::LoggedOut,
            settings,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn baseline(&self) -> &GradeSet {
        &self.baseline
    }

    /// First login. A rejected login is fatal since the credentials are wrong; a transport
    /// failure leaves the monitor `LoggedOut` and the first cycle tries again.
    pub async fn start(&mut self) -> Result<(), AuthError> {
        match self.portal.authenticate(&self.credentials).await {
            Ok(session) => {
                info!("Logged in, watching {}", self.query);
                self.state = SessionState::LoggedIn(session);
                Ok(())
            }
            Err(e @ AuthError::Rejected(_)) => {
                self.portal.close().await;
                Err(e)
            }
            Err(e) => {
                warn!("Portal unreachable at startup, retrying next cycle: {e}");
                Ok(())
            }
        }
    }

    /// Polls until `shutdown` fires, then releases the portal client.
    pub async fn run(&mut self, shutdown: &Shutdown) {
        info!("Polling {} every {:?}", self.query, self.settings.poll_interval);
        while !shutdown.is_triggered() {
            let outcome = tokio::select! {
                outcome = self.run_cycle() => outcome,
                _ = shutdown.triggered() => break,
            };
            debug!("Cycle finished: {outcome:?}");
            if !shutdown.sleep(self.settings.poll_interval).await {
                break;
            }
        }
        info!("Shutdown requested, closing portal session");
        self.portal.close().await;
    }

    /// One authenticate-if-needed, fetch, diff, notify, persist pass. Never fails; problems are
    /// logged and the next cycle tries again.
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        if self.state == SessionState::LoggedOut {
            match self.portal.authenticate(&self.credentials).await {
                Ok(session) => {
                    info!("Logged back in to the portal");
                    self.state = SessionState::LoggedIn(session);
                }
                Err(e) => {
                    warn!("Login failed, retrying next cycle: {e}");
                    return CycleOutcome::LoginFailed;
                }
            }
        }
        let SessionState::LoggedIn(session) = &self.state else {
            return CycleOutcome::LoginFailed;
        };
        let session = session.clone();

        let current = match self.portal.fetch_grades(&session, &self.query).await {
            Ok(current) => current,
            Err(FetchError::Navigation(e)) => {
                warn!("Could not open {}: {e}", self.query);
                return CycleOutcome::FetchFailed;
            }
            Err(e) => {
                warn!("Fetching grades failed, logging in again next cycle: {e}");
                self.log_out().await;
                return CycleOutcome::FetchFailed;
            }
        };

        self.apply(current).await
    }

    async fn log_out(&mut self) {
        self.state = SessionState::LoggedOut;
        self.portal.close().await;
    }

    async fn apply(&mut self, current: GradeSet) -> CycleOutcome {
        let (new, updated) = match diff_grades(&self.baseline, &current) {
            GradeDiff::SkippedEmpty => {
                warn!("Portal returned no grades but {} are known, ignoring this fetch", self.baseline.len());
                return CycleOutcome::SkippedEmpty;
            }
            GradeDiff::Changes { new, updated } => (new, updated),
        };

        let announced = if !new.is_empty() {
            Some((format!("{} new grade(s): {}", new.len(), new.join(", ")), new))
        } else if self.settings.notify_on_update && !updated.is_empty() {
            Some((format!("{} grade(s) updated: {}", updated.len(), updated.join(", ")), updated))
        } else {
            if !updated.is_empty() {
                info!("Scores changed for {}, baseline updated without notifying", updated.join(", "));
            }
            None
        };

        if let Some((title, _)) = &announced {
            info!("{title}");
            let content = render_grades(&self.query, &current);
            if let Err(e) = self.notifier.notify(title, &content).await {
                // Keep the old baseline so the same change is announced again next cycle.
                error!("Notification failed: {e}");
                return CycleOutcome::NotifyFailed;
            }
        }

        if current != self.baseline || !self.persisted {
            self.baseline = current;
            self.persisted = match self.store.save(&self.baseline) {
                Ok(()) => true,
                Err(e) => {
                    error!("Could not persist baseline to {}, retrying next cycle: {e}", self.store.path().display());
                    false
                }
            };
        }

        match announced {
            Some((_, names)) => CycleOutcome::Notified(names),
            None => CycleOutcome::Unchanged,
        }
    }
}

/// Mail body: every course of the term in a three-column table.
pub fn render_grades(query: &TermQuery, grades: &GradeSet) -> String {
    let headers = ("Course", "Score", "Credit");
    let name_w = column_width(grades.iter().map(|g| g.name.as_str()), headers.0);
    let score_w = column_width(grades.iter().map(|g| g.score.as_str()), headers.1);

    let mut out = format!("Grades for {query}:\n");
    out.push_str(&format!("{:<name_w$}  {:<score_w$}  {}\n", headers.0, headers.1, headers.2));
    for grade in grades {
        out.push_str(&format!("{:<name_w$}  {:<score_w$}  {}\n", grade.name, grade.score, grade.credit));
    }
    out
}

fn column_width<'a>(values: impl Iterator<Item = &'a str>, header: &str) -> usize {
    values.map(|v| v.chars().count()).chain([header.chars().count()]).max().unwrap_or(0)
}
