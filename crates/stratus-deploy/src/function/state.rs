//! Typestate for a single function deployment.
//!
//! The phases of `ensure_func` are encoded in the type system so the deploy
//! loop can only take the transitions the algorithm allows:
//!
//! ```text
//! Absent ──start_create──▶ Creating ──created──▶ Active
//!                             │
//!                           exists
//!                             ▼
//!                          Updating ──updated──▶ Active
//!                             │
//!                       start_replace
//!                             ▼
//!                          Deleting ──deleted──▶ Absent
//! ```
//!
//! A deployment counts how often it went through `Deleting`, which lets the
//! loop refuse a second replacement.

use std::fmt;
use std::marker::PhantomData;

// =============================================================================
// State marker types (zero-sized)
// =============================================================================

/// Runtime view of a deployment phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionPhase {
    /// No function exists.
    Absent,
    /// A create call is being issued.
    Creating,
    /// An existing function is being brought up to date.
    Updating,
    /// The function is being deleted for replacement.
    Deleting,
    /// The function runs the desired image and configuration.
    Active,
}

impl FunctionPhase {
    /// Phase name for logs and errors.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Creating => "creating",
            Self::Updating => "updating",
            Self::Deleting => "deleting",
            Self::Active => "active",
        }
    }
}

impl fmt::Display for FunctionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Marker trait for deployment phases.
pub trait FunctionState: private::Sealed + Send + Sync {
    /// Runtime representation.
    fn phase() -> FunctionPhase;
}

mod private {
    pub trait Sealed {}
}

/// No function exists yet, or it was deleted for replacement.
#[derive(Debug, Clone, Copy)]
pub struct Absent;

/// Create issued.
#[derive(Debug, Clone, Copy)]
pub struct Creating;

/// Existing function found; configuration and code are being reconciled.
#[derive(Debug, Clone, Copy)]
pub struct Updating;

/// Existing function has an incompatible shape and is being deleted.
#[derive(Debug, Clone, Copy)]
pub struct Deleting;

/// Deployed and settled.
#[derive(Debug, Clone, Copy)]
pub struct Active;

impl private::Sealed for Absent {}
impl private::Sealed for Creating {}
impl private::Sealed for Updating {}
impl private::Sealed for Deleting {}
impl private::Sealed for Active {}

impl FunctionState for Absent {
    fn phase() -> FunctionPhase {
        FunctionPhase::Absent
    }
}

impl FunctionState for Creating {
    fn phase() -> FunctionPhase {
        FunctionPhase::Creating
    }
}

impl FunctionState for Updating {
    fn phase() -> FunctionPhase {
        FunctionPhase::Updating
    }
}

impl FunctionState for Deleting {
    fn phase() -> FunctionPhase {
        FunctionPhase::Deleting
    }
}

impl FunctionState for Active {
    fn phase() -> FunctionPhase {
        FunctionPhase::Active
    }
}

// =============================================================================
// Deployment parameterised by phase
// =============================================================================

/// A function deployment in phase `S`.
#[derive(Debug)]
pub struct FunctionDeployment<S: FunctionState> {
    name: String,
    image_uri: String,
    arn: Option<String>,
    replacements: u32,
    _state: PhantomData<S>,
}

impl<S: FunctionState> FunctionDeployment<S> {
    /// Function name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Image being deployed.
    #[must_use]
    pub fn image_uri(&self) -> &str {
        &self.image_uri
    }

    /// Number of delete-and-recreate cycles so far.
    #[must_use]
    pub const fn replacements(&self) -> u32 {
        self.replacements
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> FunctionPhase {
        S::phase()
    }

    fn transition<T: FunctionState>(self) -> FunctionDeployment<T> {
        FunctionDeployment {
            name: self.name,
            image_uri: self.image_uri,
            arn: self.arn,
            replacements: self.replacements,
            _state: PhantomData,
        }
    }
}

impl FunctionDeployment<Absent> {
    /// Start a deployment of `image_uri` to function `name`.
    #[must_use]
    pub fn new(name: impl Into<String>, image_uri: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image_uri: image_uri.into(),
            arn: None,
            replacements: 0,
            _state: PhantomData,
        }
    }

    /// Issue the create.
    #[must_use]
    pub fn start_create(self) -> FunctionDeployment<Creating> {
        self.transition()
    }
}

impl FunctionDeployment<Creating> {
    /// The create succeeded and the function settled.
    #[must_use]
    pub fn created(self, arn: String) -> FunctionDeployment<Active> {
        let mut active = self.transition::<Active>();
        active.arn = Some(arn);
        active
    }

    /// The function already existed.
    #[must_use]
    pub fn exists(self) -> FunctionDeployment<Updating> {
        self.transition()
    }
}

impl FunctionDeployment<Updating> {
    /// Configuration and code are current and the function settled.
    #[must_use]
    pub fn updated(self, arn: String) -> FunctionDeployment<Active> {
        let mut active = self.transition::<Active>();
        active.arn = Some(arn);
        active
    }

    /// Delete the function so it can be recreated with a new shape.
    #[must_use]
    pub fn start_replace(self) -> FunctionDeployment<Deleting> {
        self.transition()
    }
}

impl FunctionDeployment<Deleting> {
    /// The function is gone.
    #[must_use]
    pub fn deleted(self) -> FunctionDeployment<Absent> {
        let mut absent = self.transition::<Absent>();
        absent.replacements += 1;
        absent
    }
}

impl FunctionDeployment<Active> {
    /// ARN of the deployed function.
    #[must_use]
    pub fn arn(&self) -> &str {
        self.arn.as_deref().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_path_reaches_active() {
        let absent = FunctionDeployment::new("app-func-qa", "repo:tag");
        assert_eq!(absent.phase(), FunctionPhase::Absent);

        let creating = absent.start_create();
        assert_eq!(creating.phase(), FunctionPhase::Creating);

        let active = creating.created("arn:fn".to_owned());
        assert_eq!(active.phase(), FunctionPhase::Active);
        assert_eq!(active.arn(), "arn:fn");
        assert_eq!(active.replacements(), 0);
    }

    #[test]
    fn replacement_is_counted() {
        let updating = FunctionDeployment::new("f", "repo:tag").start_create().exists();
        assert_eq!(updating.phase(), FunctionPhase::Updating);

        let deleting = updating.start_replace();
        assert_eq!(deleting.phase().as_str(), "deleting");

        let absent = deleting.deleted();
        assert_eq!(absent.replacements(), 1);
        assert_eq!(absent.image_uri(), "repo:tag");
        assert_eq!(absent.name(), "f");
    }
}
