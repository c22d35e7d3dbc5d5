pub mod helpers;
mod property;
mod unit;
