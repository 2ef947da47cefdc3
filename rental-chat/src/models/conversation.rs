use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A thread between a seller and a renter about one listing.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub conversation_id: String,
    pub seller_id: String,
    pub renter_id: String,
    pub product_id: String,
    #[serde(default)]
    pub last_message: String,
    #[serde(default)]
    pub last_message_timestamp: i64,
}

impl Conversation {
    pub fn new(
        product_id: impl Into<String>,
        seller_id: impl Into<String>,
        renter_id: impl Into<String>,
    ) -> Self {
        let product_id = product_id.into();
        let seller_id = seller_id.into();
        let renter_id = renter_id.into();
        Self {
            conversation_id: Self::derive_id(&product_id, &seller_id, &renter_id),
            seller_id,
            renter_id,
            product_id,
            last_message: String::new(),
            last_message_timestamp: 0,
        }
    }

    /// Deterministic id for a participant pair on one listing.
    /// Roles are fixed, so seller and renter are not interchangeable.
    ///
    /// SHA-256 over each part prefixed with its big-endian u64 length,
    /// truncated to 16 bytes. Ids are persisted, so this layout must not change.
    pub fn derive_id(product_id: &str, seller_id: &str, renter_id: &str) -> String {
        let mut hasher = Sha256::new();
        for part in [product_id, seller_id, renter_id] {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part.as_bytes());
        }
        let digest = hasher.finalize();
        format!("conv_{}", hex::encode(&digest[..16]))
    }

    pub fn is_participant(&self, user_id: &str) -> bool {
        self.seller_id == user_id || self.renter_id == user_id
    }

    /// The participant that is not `viewer_id`, or `None` if the viewer
    /// is not part of this conversation.
    pub fn other_participant(&self, viewer_id: &str) -> Option<&str> {
        if self.seller_id == viewer_id {
            Some(&self.renter_id)
        } else if self.renter_id == viewer_id {
            Some(&self.seller_id)
        } else {
            None
        }
    }

    pub fn is_renter(&self, viewer_id: &str) -> bool {
        self.renter_id == viewer_id
    }

    /// Ordering used by conversation lists: most recent first, then id.
    pub fn recency_cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .last_message_timestamp
            .cmp(&self.last_message_timestamp)
            .then_with(|| self.conversation_id.cmp(&other.conversation_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_id_is_per_listing() {
        let a = Conversation::derive_id("p1", "seller", "renter");
        let b = Conversation::derive_id("p2", "seller", "renter");
        assert_ne!(a, b);
        assert_eq!(a, Conversation::derive_id("p1", "seller", "renter"));
    }

    #[test]
    fn test_derive_id_is_pinned() {
        assert_eq!(
            Conversation::derive_id("drill", "seller", "renter"),
            "conv_b9b7f441db5c6da25fce636fd1b21350"
        );
    }

    #[test]
    fn test_derive_id_respects_field_boundaries() {
        assert_eq!(
            Conversation::derive_id("ab", "c", "r"),
            "conv_07bdb10bb1d9488aba3e961b80d27f3a"
        );
        assert_ne!(
            Conversation::derive_id("ab", "c", "r"),
            Conversation::derive_id("a", "bc", "r")
        );
        assert_ne!(
            Conversation::derive_id("p1", "seller", "renter"),
            Conversation::derive_id("p1", "renter", "seller")
        );
    }

    #[test]
    fn test_other_participant() {
        let conv = Conversation::new("p1", "seller", "renter");
        assert_eq!(conv.other_participant("seller"), Some("renter"));
        assert_eq!(conv.other_participant("renter"), Some("seller"));
        assert_eq!(conv.other_participant("stranger"), None);
        assert!(conv.is_renter("renter"));
        assert!(!conv.is_renter("seller"));
    }

    #[test]
    fn test_recency_order_breaks_ties_by_id() {
        let mut convs: Vec<Conversation> = [("c1", 100), ("c2", 300), ("c3", 300), ("c4", 50)]
            .into_iter()
            .map(|(id, ts)| {
                let mut conv = Conversation::new("p", "s", "r");
                conv.conversation_id = id.to_string();
                conv.last_message_timestamp = ts;
                conv
            })
            .collect();
        convs.sort_by(Conversation::recency_cmp);

        let ids: Vec<&str> = convs.iter().map(|c| c.conversation_id.as_str()).collect();
        assert_eq!(ids, vec!["c2", "c3", "c1", "c4"]);
    }
}
