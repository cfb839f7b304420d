//! Decision core for the Mindure focus guard.
//!
//! A [`NavigationCoordinator`] reacts to page loads and same-document URL
//! changes, asks a [`PageInspector`] for a [`PageDescriptor`], runs it
//! through the [`DecisionEngine`] and tells a [`Blocker`] to cover the page
//! when the verdict is "distracting".

pub mod classifier;
pub mod control;
pub mod coordinator;
pub mod engine;
pub mod page;
pub mod settings;

pub use classifier::{ChatClassifier, Classifier, ClassifierConfig, ClassifyError};
pub use control::{Controller, Status};
pub use coordinator::{
    Blocker, CollaboratorError, CycleOutcome, NavigationCoordinator, NavigationEvent,
    PageInspector, SkipReason, TabId,
};
pub use engine::{Decision, DecisionEngine, DecisionSource};
pub use page::{CacheKey, PageDescriptor};
pub use settings::{MemorySettingsStore, Settings, SettingsError, SettingsPatch, SettingsStore};
