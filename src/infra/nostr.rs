use nostr::{
    event::{Event, EventBuilder, Kind, Tag, TagKind},
    key::{Keys, PublicKey},
    nips::nip04,
    types::Timestamp,
};
use thiserror::Error;

pub const KIND_METADATA: u16 = 0;
pub const KIND_ENCRYPTED_DM: u16 = 4;
pub const KIND_DELETION: u16 = 5;
pub const KIND_STALL: u16 = 30017;
pub const KIND_PRODUCT: u16 = 30018;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Event error: {0}")]
    Event(#[from] nostr::event::Error),

    #[error("Event builder failure: {0}")]
    EventBuild(#[from] nostr::event::builder::Error),

    #[error("Invalid key: {0}")]
    Key(#[from] nostr::key::Error),

    #[error("Encryption error: {0}")]
    Encrypt(String),

    #[error("Decryption error: {0}")]
    Decrypt(String),

    #[error("Missing public key tag in encrypted event {0}")]
    MissingPTag(String),
}

pub fn nostr_kind(kind: u16) -> Kind {
    Kind::from(kind)
}

pub fn nostr_now() -> u64 {
    Timestamp::now().as_u64()
}

pub fn tag_value(tags: &[Vec<String>], key: &str) -> Option<String> {
    tags.iter().find_map(|t| {
        if t.first().map(|k| k.as_str()) == Some(key) {
            t.get(1).cloned()
        } else {
            None
        }
    })
}

pub fn tag_values(tags: &[Vec<String>], key: &str) -> Vec<String> {
    tags.iter()
        .filter(|t| t.first().map(|k| k.as_str()) == Some(key))
        .filter_map(|t| t.get(1).cloned())
        .collect()
}

pub fn tag_has_value(tags: &[Vec<String>], key: &str, value: &str) -> bool {
    tags.iter().any(|t| {
        t.first().map(|k| k.as_str()) == Some(key) && t.get(1).map(|v| v.as_str()) == Some(value)
    })
}

pub fn build_event_with_tags(
    kind: u16,
    content: impl Into<String>,
    tag_slices: Vec<Vec<String>>,
) -> EventBuilder {
    let mut tags: Vec<Tag> = Vec::new();
    for s in tag_slices {
        if s.is_empty() {
            continue;
        }
        let key = s[0].clone();
        let values = s.into_iter().skip(1).collect::<Vec<String>>();
        tags.push(Tag::custom(TagKind::Custom(key.into()), values));
    }
    EventBuilder::new(nostr_kind(kind), content.into()).tags(tags)
}

/// Signs the builder; the id is the hash of `[0, pubkey, created_at, kind, tags, content]`.
pub fn sign_event(builder: EventBuilder, keys: &Keys) -> Result<Event, CodecError> {
    Ok(builder.sign_with_keys(keys)?)
}

/// Recomputes the canonical id and checks the signature against the author.
pub fn verify_event(event: &Event) -> Result<(), CodecError> {
    Ok(event.verify()?)
}

pub fn encrypt_message(
    keys: &Keys,
    counterparty: &PublicKey,
    plaintext: &str,
) -> Result<String, CodecError> {
    nip04::encrypt(keys.secret_key(), counterparty, plaintext)
        .map_err(|e| CodecError::Encrypt(e.to_string()))
}

pub fn decrypt_message(
    keys: &Keys,
    counterparty: &PublicKey,
    ciphertext: &str,
) -> Result<String, CodecError> {
    nip04::decrypt(keys.secret_key(), counterparty, ciphertext)
        .map_err(|e| CodecError::Decrypt(e.to_string()))
}

/// Builds and signs a kind 4 message addressed to `recipient`.
pub fn build_direct_message(
    keys: &Keys,
    recipient: &PublicKey,
    plaintext: &str,
) -> Result<Event, CodecError> {
    let content = encrypt_message(keys, recipient, plaintext)?;
    let builder = build_event_with_tags(
        KIND_ENCRYPTED_DM,
        content,
        vec![vec!["p".into(), recipient.to_hex()]],
    );
    sign_event(builder, keys)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_message_round_trip_between_parties() {
        let merchant = Keys::generate();
        let customer = Keys::generate();

        let event = build_direct_message(&merchant, &customer.public_key(), "hello").unwrap();
        verify_event(&event).unwrap();
        assert_eq!(event.kind.as_u16(), KIND_ENCRYPTED_DM);

        let tags: Vec<Vec<String>> = event.tags.iter().map(|t| t.as_slice().to_vec()).collect();
        assert!(tag_has_value(&tags, "p", &customer.public_key().to_hex()));

        let plain = decrypt_message(&customer, &merchant.public_key(), &event.content).unwrap();
        assert_eq!(plain, "hello");
    }

    #[test]
    fn tampered_event_fails_verification() {
        let keys = Keys::generate();
        let mut event = sign_event(build_event_with_tags(1, "original", vec![]), &keys).unwrap();
        event.content = "changed".into();
        assert!(verify_event(&event).is_err());
    }

    #[test]
    fn tag_helpers_read_slices() {
        let tags = vec![
            vec!["d".to_string(), "stall-1".to_string()],
            vec!["t".to_string(), "food".to_string()],
            vec!["t".to_string(), "fresh".to_string()],
        ];
        assert_eq!(tag_value(&tags, "d").as_deref(), Some("stall-1"));
        assert_eq!(tag_values(&tags, "t"), vec!["food", "fresh"]);
        assert!(!tag_has_value(&tags, "d", "other"));
    }
}
