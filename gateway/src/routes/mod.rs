pub mod health;
pub mod inference;
