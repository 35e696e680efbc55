use nostr::event::Event;

use crate::infra::nostr::{tag_has_value, tag_value, tag_values};

/// Read-only view over a signed event with hex ids and tag slices resolved once.
#[derive(Clone, Debug)]
pub struct NostrEventAdapter<'a> {
    evt: &'a Event,
    id_hex: String,
    author_hex: String,
    tags: Vec<Vec<String>>,
}

impl<'a> NostrEventAdapter<'a> {
    #[inline]
    pub fn new(evt: &'a Event) -> Self {
        Self {
            evt,
            id_hex: evt.id.to_hex(),
            author_hex: evt.pubkey.to_hex(),
            tags: evt.tags.iter().map(|t| t.as_slice().to_vec()).collect(),
        }
    }

    #[inline]
    pub fn raw_id(&self) -> &str {
        &self.id_hex
    }

    #[inline]
    pub fn raw_author(&self) -> &str {
        &self.author_hex
    }

    #[inline]
    pub fn raw_kind(&self) -> u16 {
        self.evt.kind.as_u16()
    }

    #[inline]
    pub fn raw_content(&self) -> &str {
        &self.evt.content
    }

    #[inline]
    pub fn raw_published_at(&self) -> u64 {
        self.evt.created_at.as_u64()
    }

    pub fn tag(&self, key: &str) -> Option<String> {
        tag_value(&self.tags, key)
    }

    pub fn tags_named(&self, key: &str) -> Vec<String> {
        tag_values(&self.tags, key)
    }

    pub fn has_tag_value(&self, key: &str, value: &str) -> bool {
        tag_has_value(&self.tags, key, value)
    }
}

#[cfg(test)]
mod tests {
    use nostr::key::Keys;

    use super::NostrEventAdapter;
    use crate::infra::nostr::{build_event_with_tags, sign_event, KIND_STALL};

    #[test]
    fn adapter_exposes_raw_fields() {
        let keys = Keys::generate();
        let event = sign_event(
            build_event_with_tags(KIND_STALL, "{}", vec![vec!["d".into(), "s1".into()]]),
            &keys,
        )
        .unwrap();
        let ev = NostrEventAdapter::new(&event);
        assert_eq!(ev.raw_kind(), KIND_STALL);
        assert_eq!(ev.raw_author(), keys.public_key().to_hex());
        assert_eq!(ev.raw_id(), event.id.to_hex());
        assert_eq!(ev.tag("d").as_deref(), Some("s1"));
        assert!(ev.has_tag_value("d", "s1"));
    }
}
