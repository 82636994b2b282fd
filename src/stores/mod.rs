pub mod trust_store;
