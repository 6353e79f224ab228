//! The certificate interview state machine
//!
//! The interview is linear:
//!
//! `Idle → CollectingName → CollectingGender → CollectingOffering →
//!  CollectingRevocationDate → CollectingProfileLink → Confirming →
//!  Verifying → Terminal`
//!
//! Every variant of [`Interview`] carries exactly the fields collected up to
//! that point, so a later step can never read a field that was not gathered.
//! `back` returns to the predecessor, `cancel` returns to `Idle` and `start`
//! restarts from the first question.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::catalog::{Catalog, Gender};
use crate::ids::{ExternalAccountId, FullName, OfferingId, Serial};
use crate::validate::{self, Validators, DATE_FORMAT};
use crate::{Error, Result};

/// Step names, without the data each step carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Idle,
    CollectingName,
    CollectingGender,
    CollectingOffering,
    CollectingRevocationDate,
    CollectingProfileLink,
    Confirming,
    Verifying,
    Terminal,
}

/// Forward transitions, in order. `back` walks this table in reverse.
const FORWARD: [(Step, Step); 8] = [
    (Step::Idle, Step::CollectingName),
    (Step::CollectingName, Step::CollectingGender),
    (Step::CollectingGender, Step::CollectingOffering),
    (Step::CollectingOffering, Step::CollectingRevocationDate),
    (Step::CollectingRevocationDate, Step::CollectingProfileLink),
    (Step::CollectingProfileLink, Step::Confirming),
    (Step::Confirming, Step::Verifying),
    (Step::Verifying, Step::Terminal),
];

impl Step {
    pub const ALL: [Step; 9] = [
        Step::Idle,
        Step::CollectingName,
        Step::CollectingGender,
        Step::CollectingOffering,
        Step::CollectingRevocationDate,
        Step::CollectingProfileLink,
        Step::Confirming,
        Step::Verifying,
        Step::Terminal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Idle => "idle",
            Step::CollectingName => "collecting_name",
            Step::CollectingGender => "collecting_gender",
            Step::CollectingOffering => "collecting_offering",
            Step::CollectingRevocationDate => "collecting_revocation_date",
            Step::CollectingProfileLink => "collecting_profile_link",
            Step::Confirming => "confirming",
            Step::Verifying => "verifying",
            Step::Terminal => "terminal",
        }
    }

    pub fn next(self) -> Option<Step> {
        FORWARD.iter().find(|(from, _)| *from == self).map(|(_, to)| *to)
    }

    /// Predecessor reachable with `back`
    ///
    /// Verification and the terminal step cannot be walked back out of.
    pub fn previous(self) -> Option<Step> {
        if matches!(self, Step::Idle | Step::Verifying | Step::Terminal) {
            return None;
        }
        FORWARD.iter().find(|(_, to)| *to == self).map(|(from, _)| *from)
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A requester action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "text", rename_all = "snake_case")]
pub enum Action {
    /// Begin (or restart) the interview
    Start,
    /// Answer the current question
    Submit(String),
    Back,
    Cancel,
    /// Confirm the read-back summary
    Done,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Start => "start",
            Action::Submit(_) => "submit",
            Action::Back => "back",
            Action::Cancel => "cancel",
            Action::Done => "done",
        }
    }
}

/// A complete application, ready for confirmation and verification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub full_name: FullName,
    pub gender: Gender,
    pub offering: OfferingId,
    pub revoked_on: NaiveDate,
    pub account: ExternalAccountId,
}

impl Application {
    /// Read-back summary shown at the confirmation step
    pub fn summary(&self, catalog: &Catalog) -> Summary {
        let offering_title = catalog
            .get(&self.offering)
            .map(|o| o.title.clone())
            .unwrap_or_else(|| self.offering.to_string());
        Summary {
            full_name: self.full_name.to_string(),
            gender: self.gender,
            offering_title,
            account: self.account,
            revoked_on: self.revoked_on.format(DATE_FORMAT).to_string(),
        }
    }
}

/// Read-back of a completed application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub full_name: String,
    pub gender: Gender,
    pub offering_title: String,
    pub account: ExternalAccountId,
    pub revoked_on: String,
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:<12}{}", "Name:", self.full_name)?;
        writeln!(f, "{:<12}{}", "Gender:", self.gender)?;
        writeln!(f, "{:<12}{}", "Course:", self.offering_title)?;
        writeln!(f, "{:<12}{}", "Account:", self.account)?;
        write!(f, "{:<12}{}", "Review date:", self.revoked_on)
    }
}

/// Interview state for one requester
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum Interview {
    #[default]
    Idle,
    CollectingName,
    CollectingGender {
        full_name: FullName,
    },
    CollectingOffering {
        full_name: FullName,
        gender: Gender,
    },
    CollectingRevocationDate {
        full_name: FullName,
        gender: Gender,
        offering: OfferingId,
    },
    CollectingProfileLink {
        full_name: FullName,
        gender: Gender,
        offering: OfferingId,
        revoked_on: NaiveDate,
    },
    Confirming {
        application: Application,
    },
    /// Verification in flight; `attempt` identifies this run so that a
    /// cancelled run can recognise it no longer owns the session.
    Verifying {
        application: Application,
        attempt: u64,
    },
    Terminal {
        serial: Serial,
    },
}

/// Outcome of applying an action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Next {
    /// Move to this state
    State(Interview),
    /// The requester confirmed; verification should start for this application
    Verify(Application),
}

impl Interview {
    pub fn step(&self) -> Step {
        match self {
            Interview::Idle => Step::Idle,
            Interview::CollectingName => Step::CollectingName,
            Interview::CollectingGender { .. } => Step::CollectingGender,
            Interview::CollectingOffering { .. } => Step::CollectingOffering,
            Interview::CollectingRevocationDate { .. } => Step::CollectingRevocationDate,
            Interview::CollectingProfileLink { .. } => Step::CollectingProfileLink,
            Interview::Confirming { .. } => Step::Confirming,
            Interview::Verifying { .. } => Step::Verifying,
            Interview::Terminal { .. } => Step::Terminal,
        }
    }

    /// Apply a requester action
    ///
    /// On error the interview is unchanged: the caller keeps `self` and
    /// re-prompts for the same step.
    pub fn apply(&self, action: &Action, v: &Validators<'_>) -> Result<Next> {
        match action {
            Action::Start => Ok(Next::State(Interview::CollectingName)),
            Action::Cancel => Ok(Next::State(Interview::Idle)),
            Action::Back => self.back().map(Next::State),
            Action::Submit(input) => self.submit(input, v).map(Next::State),
            Action::Done => match self {
                Interview::Confirming { application } => Ok(Next::Verify(application.clone())),
                _ => Err(self.unexpected(action)),
            },
        }
    }

    fn back(&self) -> Result<Interview> {
        let previous = match self.clone() {
            Interview::CollectingName => Interview::Idle,
            Interview::CollectingGender { .. } => Interview::CollectingName,
            Interview::CollectingOffering { full_name, .. } => {
                Interview::CollectingGender { full_name }
            }
            Interview::CollectingRevocationDate {
                full_name, gender, ..
            } => Interview::CollectingOffering { full_name, gender },
            Interview::CollectingProfileLink {
                full_name,
                gender,
                offering,
                ..
            } => Interview::CollectingRevocationDate {
                full_name,
                gender,
                offering,
            },
            Interview::Confirming { application } => Interview::CollectingProfileLink {
                full_name: application.full_name,
                gender: application.gender,
                offering: application.offering,
                revoked_on: application.revoked_on,
            },
            Interview::Idle | Interview::Verifying { .. } | Interview::Terminal { .. } => {
                return Err(self.unexpected(&Action::Back))
            }
        };
        debug_assert_eq!(self.step().previous(), Some(previous.step()));
        Ok(previous)
    }

    fn submit(&self, input: &str, v: &Validators<'_>) -> Result<Interview> {
        let next = match self.clone() {
            Interview::CollectingName => Interview::CollectingGender {
                full_name: validate::full_name(input)?,
            },
            Interview::CollectingGender { full_name } => Interview::CollectingOffering {
                full_name,
                gender: validate::gender(input)?,
            },
            Interview::CollectingOffering { full_name, gender } => {
                let offering = validate::offering(v.catalog, input)?;
                Interview::CollectingRevocationDate {
                    full_name,
                    gender,
                    offering: offering.id.clone(),
                }
            }
            Interview::CollectingRevocationDate {
                full_name,
                gender,
                offering,
            } => {
                let known = v
                    .catalog
                    .get(&offering)
                    .ok_or_else(|| Error::UnknownOffering(offering.to_string()))?;
                let revoked_on = validate::revocation_date(input, known, v.today)?;
                Interview::CollectingProfileLink {
                    full_name,
                    gender,
                    offering,
                    revoked_on,
                }
            }
            Interview::CollectingProfileLink {
                full_name,
                gender,
                offering,
                revoked_on,
            } => Interview::Confirming {
                application: Application {
                    full_name,
                    gender,
                    offering,
                    revoked_on,
                    account: v.links.extract(input)?,
                },
            },
            _ => return Err(self.unexpected(&Action::Submit(String::new()))),
        };
        debug_assert_eq!(self.step().next(), Some(next.step()));
        Ok(next)
    }

    fn unexpected(&self, action: &Action) -> Error {
        Error::UnexpectedAction {
            action: action.as_str(),
            step: self.step().as_str(),
        }
    }
}
