//! Decides whether an incoming entry is a new post or an update of one
//! already stored for the feed.

use feedsync_core::{NormalizedPost, Post};
use feedsync_storage::PostFilter;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Create,
    Update(Uuid),
}

/// Fields compared, in order, when several stored posts share an entry's
/// title and publish date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TieBreaker {
    Author,
    Link,
    Content,
}

impl TieBreaker {
    pub const ORDER: [TieBreaker; 3] = [TieBreaker::Author, TieBreaker::Link, TieBreaker::Content];

    fn agrees(self, candidate: &NormalizedPost, existing: &Post) -> bool {
        match self {
            TieBreaker::Author => candidate.author == existing.author,
            TieBreaker::Link => candidate.link == existing.link,
            TieBreaker::Content => candidate.content == existing.content,
        }
    }
}

/// Lookup key for stored posts that may be the same entry: the guid when
/// present, else title plus publish date.
pub fn identity_filter(candidate: &NormalizedPost) -> PostFilter {
    if candidate.guid.is_empty() {
        PostFilter::TitleAndDate {
            feed_id: candidate.feed_id,
            title: candidate.title.clone(),
            published_at: candidate.published_at,
        }
    } else {
        PostFilter::Guid {
            feed_id: candidate.feed_id,
            guid: candidate.guid.clone(),
        }
    }
}

/// Resolve `candidate` against the posts returned for [`identity_filter`].
///
/// A guid match is always the same post. Title/date matches are scanned in
/// store order and the first one agreeing with the candidate on author, link
/// or content (checked in that order) is updated.
pub fn resolve_duplicate(candidate: &NormalizedPost, existing: &[Post]) -> Resolution {
    if !candidate.guid.is_empty() {
        return existing
            .iter()
            .find(|post| post.guid == candidate.guid)
            .map_or(Resolution::Create, |post| Resolution::Update(post.id));
    }

    existing
        .iter()
        .find(|post| first_agreement(candidate, post).is_some())
        .map_or(Resolution::Create, |post| Resolution::Update(post.id))
}

/// First field, in [`TieBreaker::ORDER`], on which `existing` agrees with `candidate`.
pub fn first_agreement(candidate: &NormalizedPost, existing: &Post) -> Option<TieBreaker> {
    TieBreaker::ORDER
        .into_iter()
        .find(|field| field.agrees(candidate, existing))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn candidate(guid: &str, author: &str, link: &str, content: &str) -> NormalizedPost {
        NormalizedPost {
            feed_id: Uuid::nil(),
            guid: guid.into(),
            title: "Hello".into(),
            author: author.into(),
            link: link.into(),
            content: content.into(),
            published_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            updated_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    fn stored(post: &NormalizedPost) -> Post {
        Post::from_normalized(Uuid::new_v4(), post, Utc::now())
    }

    #[test]
    fn guid_picks_identity_filter() {
        assert!(matches!(
            identity_filter(&candidate("abc", "", "", "")),
            PostFilter::Guid { ref guid, .. } if guid == "abc"
        ));
        assert!(matches!(
            identity_filter(&candidate("", "", "", "")),
            PostFilter::TitleAndDate { ref title, .. } if title == "Hello"
        ));
    }

    #[test]
    fn guid_match_updates() {
        let existing = stored(&candidate("abc", "A", "l", "old"));
        let incoming = candidate("abc", "B", "other", "new");
        assert_eq!(
            resolve_duplicate(&incoming, &[existing.clone()]),
            Resolution::Update(existing.id)
        );
        assert_eq!(resolve_duplicate(&incoming, &[]), Resolution::Create);
    }

    #[test]
    fn title_date_match_without_agreement_creates() {
        let alice = stored(&candidate("", "Alice", "https://a", "x"));
        let bob = candidate("", "Bob", "https://b", "y");
        assert_eq!(resolve_duplicate(&bob, &[alice]), Resolution::Create);
    }

    #[test]
    fn earlier_stored_post_wins_over_a_better_field_match() {
        let by_link = stored(&candidate("", "Carol", "https://same", "x"));
        let by_author = stored(&candidate("", "Dave", "https://other", "y"));
        let incoming = candidate("", "Dave", "https://same", "z");
        assert_eq!(
            resolve_duplicate(&incoming, &[by_link.clone(), by_author.clone()]),
            Resolution::Update(by_link.id)
        );
        assert_eq!(
            resolve_duplicate(&incoming, &[by_author.clone(), by_link]),
            Resolution::Update(by_author.id)
        );
    }

    #[test]
    fn first_post_agreeing_only_on_link_is_updated() {
        let link_only = stored(&candidate("", "Erin", "https://shared", "old body"));
        let unrelated = stored(&candidate("", "Frank", "https://elsewhere", "other"));
        let incoming = candidate("", "Grace", "https://shared", "new body");
        assert_eq!(
            first_agreement(&incoming, &link_only),
            Some(TieBreaker::Link)
        );
        assert_eq!(first_agreement(&incoming, &unrelated), None);
        assert_eq!(
            resolve_duplicate(&incoming, &[link_only.clone(), unrelated]),
            Resolution::Update(link_only.id)
        );
    }

    #[test]
    fn author_is_checked_before_link_on_one_post() {
        let post = stored(&candidate("", "Heidi", "https://same", "x"));
        let incoming = candidate("", "Heidi", "https://same", "y");
        assert_eq!(first_agreement(&incoming, &post), Some(TieBreaker::Author));
    }

    #[test]
    fn content_is_the_last_tie_breaker() {
        let first = stored(&candidate("", "A", "https://1", "body"));
        let second = stored(&candidate("", "B", "https://2", "body"));
        let incoming = candidate("", "C", "https://3", "body");
        assert_eq!(
            resolve_duplicate(&incoming, &[first.clone(), second]),
            Resolution::Update(first.id)
        );
    }
}
