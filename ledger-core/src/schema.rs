//! Canonical store schema
//!
//! One column family per record family plus a shared `indices` family for
//! parent → child lookups. The schema is fixed; there is no runtime probing.
//!
//! # Index keys
//!
//! ```text
//! [tag: u8][parent: 16 bytes][child: 16 bytes] -> empty
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

/// Column family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Family {
    /// Shipments (key: shipment id)
    Shipments,
    /// Offers (key: offer id)
    Offers,
    /// Driver listings (key: listing id)
    Listings,
    /// Driver bids (key: bid id)
    Bids,
    /// Wallets (key: owner id)
    Wallets,
    /// Ledger entries (key: entry id)
    Entries,
    /// Secondary indices
    Indices,
    /// Idempotency records (key: sha256 of actor + token)
    Idempotency,
}

impl Family {
    /// Every family, in creation order
    pub const ALL: [Family; 8] = [
        Family::Shipments,
        Family::Offers,
        Family::Listings,
        Family::Bids,
        Family::Wallets,
        Family::Entries,
        Family::Indices,
        Family::Idempotency,
    ];

    /// Column family name
    pub fn name(&self) -> &'static str {
        match self {
            Family::Shipments => "shipments",
            Family::Offers => "offers",
            Family::Listings => "listings",
            Family::Bids => "bids",
            Family::Wallets => "wallets",
            Family::Entries => "entries",
            Family::Indices => "indices",
            Family::Idempotency => "idempotency",
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Secondary index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Index {
    /// shipment → offers
    OffersByShipment = 1,
    /// wallet owner → ledger entries
    EntriesByWallet = 2,
    /// shipment → listings
    ListingsByShipment = 3,
    /// listing → bids
    BidsByListing = 4,
}

impl Index {
    /// Key prefix covering every child of `parent`
    pub fn prefix(&self, parent: Uuid) -> Vec<u8> {
        let mut key = Vec::with_capacity(17);
        key.push(*self as u8);
        key.extend_from_slice(parent.as_bytes());
        key
    }

    /// Full index key for one parent/child pair
    pub fn key(&self, parent: Uuid, child: Uuid) -> Vec<u8> {
        let mut key = self.prefix(parent);
        key.extend_from_slice(child.as_bytes());
        key
    }

    /// Extract the child id from a full index key
    pub fn child_of(key: &[u8]) -> Option<Uuid> {
        if key.len() != 33 {
            return None;
        }
        let bytes: [u8; 16] = key[17..33].try_into().ok()?;
        Some(Uuid::from_bytes(bytes))
    }
}

/// A value stored under its own id in a fixed column family
pub trait Record: Serialize + DeserializeOwned {
    /// Column family holding this record type
    const FAMILY: Family;

    /// Primary key
    fn id(&self) -> Uuid;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_key_layout() {
        let parent = Uuid::new_v4();
        let child = Uuid::new_v4();
        let key = Index::OffersByShipment.key(parent, child);

        assert_eq!(key.len(), 33);
        assert_eq!(key[0], 1);
        assert!(key.starts_with(&Index::OffersByShipment.prefix(parent)));
        assert_eq!(Index::child_of(&key), Some(child));
    }

    #[test]
    fn test_family_names_unique() {
        let mut names: Vec<_> = Family::ALL.iter().map(|f| f.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), Family::ALL.len());
    }
}
