//! Storage budget accounting and the on-disk corpus layout.

mod accountant;
mod asset_store;

pub use accountant::{LedgerSnapshot, ReservationToken, StorageAccountant, StorageError};
pub use asset_store::{AssetStore, AssetStoreError, StagedAsset};
