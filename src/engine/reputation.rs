use crate::model::*;

/// Reputation-affecting lifecycle outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    NoShow,
}

/// Rating bump for a normal completion, in tenths.
const COMPLETION_BONUS_TENTHS: u16 = 2;

/// Next reputation after `outcome`, or `None` when the policy is disabled.
pub fn on_transition(
    current: &CustomerReputation,
    policy: &ReputationPolicy,
    outcome: Outcome,
) -> Option<CustomerReputation> {
    if !policy.enabled {
        return None;
    }
    let mut next = current.clone();
    match outcome {
        Outcome::NoShow => {
            next.rating = policy.no_show_penalty_rating;
            next.no_show_count = next.no_show_count.saturating_add(1);
        }
        Outcome::Completed => {
            next.rating = if current.rating < policy.min_rating_for_no_advance && policy.recover_on_show {
                Rating::MAX
            } else {
                current.rating.saturating_add_tenths(COMPLETION_BONUS_TENTHS)
            };
            next.completed_count = next.completed_count.saturating_add(1);
        }
    }
    Some(next)
}

pub fn requires_advance_payment(rep: &CustomerReputation, policy: &ReputationPolicy) -> bool {
    policy.enabled && rep.rating < policy.min_rating_for_no_advance
}

/// Advance owed on `total`, rounded half-up to the cent.
pub fn advance_payment(
    rep: &CustomerReputation,
    policy: &ReputationPolicy,
    total: Money,
) -> Option<AdvancePayment> {
    if !requires_advance_payment(rep, policy) || policy.advance_percent == 0 {
        return None;
    }
    let percent = policy.advance_percent.min(100);
    Some(AdvancePayment {
        percent,
        amount: (total * Money::from(percent) + 50) / 100,
    })
}

pub fn info(rep: &CustomerReputation, policy: &ReputationPolicy) -> ReputationInfo {
    let requires = requires_advance_payment(rep, policy);
    ReputationInfo {
        customer_id: rep.customer_id,
        rating: rep.rating,
        no_show_count: rep.no_show_count,
        completed_count: rep.completed_count,
        requires_advance_payment: requires,
        advance_percent: if requires { policy.advance_percent } else { 0 },
    }
}
