use crate::cli::actions::{monitor, Action};
use anyhow::Result;

/// Execute the provided action.
/// # Errors
/// Returns an error if the action fails.
pub async fn execute(action: Action) -> Result<()> {
    match action {
        Action::Monitor(args) => monitor::execute(args).await,
    }
}
