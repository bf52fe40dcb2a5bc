use tracing::debug;

use crate::error::{Result, SignerError};
use crate::transaction::{ChangeEstimate, TransactionBuilder, UnsignedInput};

/// Result of input selection: the chosen inputs and the sizing that
/// justified them.
#[derive(Debug, Clone)]
pub struct InputSelection {
    pub selected: Vec<UnsignedInput>,
    /// Total value of the selected inputs in satoshis.
    pub total: u64,
    pub estimate: ChangeEstimate,
}

/// Pick inputs from `candidates` to fund `template`'s outputs.
///
/// Largest-first: candidates are added in descending value order and the
/// template is re-sized with the real fee accountant after each addition, so
/// selection prices inputs exactly as the final build will. Any inputs
/// already on the template are replaced.
pub fn select_inputs(
    candidates: &[UnsignedInput],
    template: &TransactionBuilder,
) -> Result<InputSelection> {
    if candidates.is_empty() {
        return Err(SignerError::InvalidInput("no inputs available".into()));
    }

    let mut sorted: Vec<&UnsignedInput> = candidates.iter().collect();
    sorted.sort_by(|a, b| b.amount.cmp(&a.amount));

    let mut selected: Vec<UnsignedInput> = Vec::new();
    let mut total: u64 = 0;
    let mut last = None;

    for candidate in sorted {
        selected.push(candidate.clone());
        total += candidate.amount;

        let estimate = template
            .clone()
            .with_inputs(selected.clone())
            .estimate_change()?;
        debug!(
            selected = selected.len(),
            total,
            surplus = estimate.surplus(),
            "input selection step"
        );
        if estimate.is_funded() {
            return Ok(InputSelection {
                selected,
                total,
                estimate,
            });
        }
        last = Some(estimate);
    }

    // The loop ran at least once, so `last` is set.
    let required = last
        .map(|estimate| estimate.total_output + estimate.fee())
        .unwrap_or_default();
    Err(SignerError::InsufficientFunds {
        required,
        available: total,
        shortfall: required.saturating_sub(total),
    })
}
