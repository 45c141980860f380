//! Double-entry ledger (§4.3): accounts, entry validation, transaction
//! prepare/commit, and balance snapshotting.

pub mod accounts;
pub mod guard;
pub mod transactions;

pub use accounts::{get_or_create_account, Account, AccountType, Direction, OwnerType};
pub use guard::EntryInput;
pub use transactions::{
    commit_transaction, prepare_transaction, snapshot_hash, verify_snapshot, PreparedTransaction,
    ProviderEffect,
};
