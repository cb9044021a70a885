//! Seam for the external element-matching collaborator.
//!
//! Element matching and gesture execution belong to the host UI-automation
//! framework. This crate only guarantees *when* the lookup happens: through
//! [`SyncManager::select_element_with_matcher`](crate::manager::SyncManager::select_element_with_matcher),
//! on the legacy strategy the lookup runs on the main context after a
//! successful settle. On the current strategy the returned interaction
//! synchronizes when it is performed, so the lookup runs immediately.

/// Looks up UI elements for the host automation framework.
///
/// Matchers and interactions are opaque to this crate.
pub trait ElementSelector: Send + Sync + 'static {
    /// The framework's matcher type.
    type Matcher: Send + 'static;
    /// The handle the framework returns for acting on matched elements.
    type Interaction: Send + 'static;

    /// Resolves `matcher` into an interaction handle.
    fn select_element(&self, matcher: Self::Matcher) -> Self::Interaction;
}
