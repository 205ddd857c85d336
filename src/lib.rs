pub mod catalog;
pub mod clock;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod ledger;
pub mod money;
pub mod payments;
pub mod policy;
pub mod registry;
pub mod responses;
pub mod settlement;
pub mod sweeper;
pub mod transactions;
pub mod types;
pub mod wallet;
