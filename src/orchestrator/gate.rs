/// Whether a captured selfie is shown to the user before submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationDecision {
    Show,
    Skip,
}

/// Decide from configuration alone; the artifact is never inspected.
pub fn decide(show_confirmation_dialog: bool) -> ConfirmationDecision {
    if show_confirmation_dialog {
        ConfirmationDecision::Show
    } else {
        ConfirmationDecision::Skip
    }
}
