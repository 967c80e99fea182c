pub mod appointment;
pub mod calendar;
pub mod clinical;
pub mod conversation;
pub mod execution;
pub mod followup;
pub mod identity;
pub mod intent;
pub mod proposal;
