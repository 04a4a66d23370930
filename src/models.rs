use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

// Portal login secrets. Debug output never shows the password.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self { username: username.into(), password: password.into() }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

// Authenticated handle on the portal. The token is whatever the portal hands back (a cookie value).
// A session only lives inside `SessionState::LoggedIn`; dropping back to `LoggedOut` discards it.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    token: String,
}

impl Session {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }

    /// Session carried by the client's cookie jar rather than an explicit token.
    pub fn cookie_jar() -> Self {
        Self { token: String::new() }
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session").finish_non_exhaustive()
    }
}

// One published grade. Equality covers all three fields.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash)]
pub struct CourseScore {
    #[serde(rename = "course")]
    pub name: String,
    pub score: String,
    pub credit: String,
}

impl CourseScore {
    pub fn new(name: impl Into<String>, score: impl Into<String>, credit: impl Into<String>) -> Self {
        Self { name: name.into(), score: score.into(), credit: credit.into() }
    }
}

// Grades in the order the portal returned them.
pub type GradeSet = Vec<CourseScore>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Term {
    Autumn,
    Spring,
    Summer,
}

impl Term {
    // Digit the portal expects in its `xq` field.
    pub fn code(self) -> u8 {
        match self {
            Term::Autumn => 1,
            Term::Spring => 2,
            Term::Summer => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Term::Autumn),
            2 => Some(Term::Spring),
            3 => Some(Term::Summer),
            _ => None,
        }
    }
}

impl FromStr for Term {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u8>()
            .ok()
            .and_then(Term::from_code)
            .ok_or_else(|| ConfigError::Invalid("TERM", format!("expected 1, 2 or 3, got {s:?}")))
    }
}

/// Academic year such as `2022-2023`, stored by its first calendar year.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AcademicYear {
    pub start: u16,
}

impl fmt::Display for AcademicYear {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.start + 1)
    }
}

impl FromStr for AcademicYear {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::Invalid("ACADEMIC_YEAR", format!("expected YYYY-YYYY, got {s:?}"));
        let (first, second) = s.trim().split_once('-').ok_or_else(invalid)?;
        let four_digits = |part: &str| part.len() == 4 && part.bytes().all(|b| b.is_ascii_digit());
        if !four_digits(first) || !four_digits(second) {
            return Err(invalid());
        }
        let start: u16 = first.parse().map_err(|_| invalid())?;
        let end: u16 = second.parse().map_err(|_| invalid())?;
        if end != start + 1 {
            return Err(invalid());
        }
        Ok(AcademicYear { start })
    }
}

/// Which semester to watch. Ordering is chronological, which term navigation relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TermQuery {
    pub year: AcademicYear,
    pub term: Term,
}

impl TermQuery {
    pub fn new(year: AcademicYear, term: Term) -> Self {
        Self { year, term }
    }
}

impl fmt::Display for TermQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} Term {}", self.year, self.term.code())
    }
}
