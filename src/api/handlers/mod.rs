pub mod approvals;
pub mod payouts;
pub mod rollouts;
pub mod simulations;
pub mod ussd;
