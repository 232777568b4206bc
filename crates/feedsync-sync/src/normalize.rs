//! Entry dating, ordering, field extraction and truncation.
//!
//! Everything here is pure: given the same entries, pass time and limits the
//! output is identical, which keeps the import loop in the engine thin.

use chrono::{DateTime, Duration as TimeDelta, NaiveDate, NaiveDateTime, TimeZone, Utc};
use feedsync_core::{
    Category, Enclosure, FieldLimits, NormalizedPost, RawCategory, RawEnclosure, RawEntry,
    NO_TITLE,
};
use scraper::{ElementRef, Html, Node};
use thiserror::Error;
use uuid::Uuid;

/// Spacing between synthesized timestamps of undated entries.
pub const SYNTHETIC_DATE_STEP_SECS: i64 = 30;

const NAIVE_DATETIME_FORMATS: [&str; 3] = ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M"];

/// Parse a feed date. Accepts RFC 3339, RFC 2822 and a few zone-less forms
/// (read as UTC). Returns `None` for anything else.
pub fn parse_entry_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(value) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in NAIVE_DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Stand-in timestamp for the entry at `index` when it carries no usable date.
pub fn synthesized_date(index: usize, now: DateTime<Utc>) -> DateTime<Utc> {
    let offset = i64::try_from(index)
        .unwrap_or(i64::MAX)
        .saturating_mul(SYNTHETIC_DATE_STEP_SECS);
    now.checked_sub_signed(TimeDelta::seconds(offset))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Best timestamp for one entry: `date`, then `updated`, then `published`,
/// then a synthesized one anchored at `now`.
pub fn resolve_entry_date(entry: &RawEntry, index: usize, now: DateTime<Utc>) -> DateTime<Utc> {
    [&entry.date, &entry.updated, &entry.published]
        .into_iter()
        .flatten()
        .find_map(|value| parse_entry_date(value))
        .unwrap_or_else(|| synthesized_date(index, now))
}

/// Newest first, ties in input order, at most `limit` entries.
pub fn order_entries(
    entries: Vec<RawEntry>,
    limit: Option<usize>,
    now: DateTime<Utc>,
) -> Vec<RawEntry> {
    let mut dated: Vec<(DateTime<Utc>, RawEntry)> = entries
        .into_iter()
        .enumerate()
        .map(|(index, entry)| (resolve_entry_date(&entry, index, now), entry))
        .collect();
    // sort_by is stable, so equal timestamps keep their input order.
    dated.sort_by(|a, b| b.0.cmp(&a.0));

    let keep = limit.unwrap_or(dated.len());
    dated.into_iter().take(keep).map(|(_, entry)| entry).collect()
}

#[derive(Debug, Error)]
#[error("could not summarize content: {0}")]
pub struct SummarizeError(pub String);

/// HTML-safe shortening of entry content for storage.
pub trait ContentSummarizer: Send + Sync {
    fn summarize(&self, html: &str) -> Result<String, SummarizeError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughSummarizer;

impl ContentSummarizer for PassthroughSummarizer {
    fn summarize(&self, html: &str) -> Result<String, SummarizeError> {
        Ok(html.to_string())
    }
}

/// Keeps the first `max_words` words of text content and appends `" ..."`,
/// closing every element still open at the cut.
///
/// Input under the limit is returned untouched. Longer input is re-serialized
/// from the parsed fragment, so comments are dropped and entities normalized.
#[derive(Debug, Clone, Copy)]
pub struct HtmlWordSummarizer {
    max_words: usize,
}

const VOID_ELEMENTS: [&str; 13] = [
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track",
    "wbr",
];

impl HtmlWordSummarizer {
    pub fn new(max_words: usize) -> Self {
        Self { max_words }
    }
}

impl ContentSummarizer for HtmlWordSummarizer {
    fn summarize(&self, html: &str) -> Result<String, SummarizeError> {
        if self.max_words == 0 {
            return Ok(html.to_string());
        }
        let fragment = Html::parse_fragment(html);
        let total: usize = fragment
            .root_element()
            .text()
            .map(|text| text.split_whitespace().count())
            .sum();
        if total <= self.max_words {
            return Ok(html.to_string());
        }

        let mut remaining = self.max_words;
        let mut out = String::with_capacity(html.len());
        write_children(fragment.root_element(), &mut remaining, &mut out);
        Ok(out)
    }
}

fn write_children(element: ElementRef<'_>, remaining: &mut usize, out: &mut String) {
    for child in element.children() {
        if *remaining == 0 {
            return;
        }
        match child.value() {
            Node::Text(text) => write_text(text, remaining, out),
            Node::Element(_) => {
                let Some(child) = ElementRef::wrap(child) else {
                    continue;
                };
                let name = child.value().name();
                out.push('<');
                out.push_str(name);
                for (key, value) in child.value().attrs() {
                    out.push_str(&format!(" {key}=\"{}\"", escape_attr(value)));
                }
                out.push('>');
                if VOID_ELEMENTS.contains(&name) {
                    continue;
                }
                write_children(child, remaining, out);
                out.push_str(&format!("</{name}>"));
            }
            _ => {}
        }
    }
}

fn write_text(text: &str, remaining: &mut usize, out: &mut String) {
    let mut words = 0;
    let mut in_word = false;
    for (index, ch) in text.char_indices() {
        if ch.is_whitespace() {
            if in_word && words == *remaining {
                out.push_str(&escape_text(&text[..index]));
                out.push_str(" ...");
                *remaining = 0;
                return;
            }
            in_word = false;
        } else if !in_word {
            in_word = true;
            words += 1;
        }
    }
    out.push_str(&escape_text(text));
    if words >= *remaining {
        out.push_str(" ...");
        *remaining = 0;
    } else {
        *remaining -= words;
    }
}

fn escape_text(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn escape_attr(value: &str) -> String {
    value.replace('&', "&amp;").replace('"', "&quot;")
}

/// Inputs shared by every field rule for one entry.
pub struct ExtractContext<'a> {
    pub feed_id: Uuid,
    pub feed_url: &'a str,
    pub now: DateTime<Utc>,
    pub summarizer: &'a dyn ContentSummarizer,
}

/// The fixed set of post field rules. Each rule reads the raw entry on its
/// own and writes exactly one field, so a degenerate value in one field
/// never affects another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostField {
    Content,
    Link,
    Guid,
    Title,
    Author,
    PublishedAt,
    UpdatedAt,
}

impl PostField {
    pub const ALL: [PostField; 7] = [
        PostField::Content,
        PostField::Link,
        PostField::Guid,
        PostField::Title,
        PostField::Author,
        PostField::PublishedAt,
        PostField::UpdatedAt,
    ];

    pub fn name(self) -> &'static str {
        match self {
            PostField::Content => "content",
            PostField::Link => "link",
            PostField::Guid => "guid",
            PostField::Title => "title",
            PostField::Author => "author",
            PostField::PublishedAt => "published_at",
            PostField::UpdatedAt => "updated_at",
        }
    }

    pub fn apply(self, entry: &RawEntry, ctx: &ExtractContext<'_>, post: &mut NormalizedPost) {
        match self {
            PostField::Content => post.content = extract_content(entry, ctx.summarizer),
            PostField::Link => post.link = extract_link(entry, ctx.feed_url),
            PostField::Guid => post.guid = extract_guid(entry),
            PostField::Title => post.title = extract_title(entry),
            PostField::Author => post.author = extract_author(entry),
            PostField::PublishedAt => {
                post.published_at = extract_date(entry.published.as_deref(), ctx.now)
            }
            PostField::UpdatedAt => post.updated_at = extract_date(entry.updated.as_deref(), ctx.now),
        }
    }
}

/// First content block, else summary, else description, through the summarizer.
pub fn extract_content(entry: &RawEntry, summarizer: &dyn ContentSummarizer) -> String {
    let raw = entry
        .content
        .first()
        .map(|block| block.value.as_str())
        .or(entry.summary.as_deref())
        .or(entry.description.as_deref())
        .unwrap_or_default();
    summarizer.summarize(raw).unwrap_or_default()
}

pub fn extract_link(entry: &RawEntry, feed_url: &str) -> String {
    entry
        .link
        .as_deref()
        .map(str::trim)
        .filter(|link| !link.is_empty())
        .unwrap_or(feed_url)
        .to_string()
}

pub fn extract_guid(entry: &RawEntry) -> String {
    entry.guid.as_deref().map(str::trim).unwrap_or_default().to_string()
}

pub fn extract_title(entry: &RawEntry) -> String {
    entry
        .title
        .as_deref()
        .map(str::trim)
        .unwrap_or(NO_TITLE)
        .to_string()
}

pub fn extract_author(entry: &RawEntry) -> String {
    entry.author.as_deref().map(str::trim).unwrap_or_default().to_string()
}

pub fn extract_date(value: Option<&str>, now: DateTime<Utc>) -> DateTime<Utc> {
    value.and_then(parse_entry_date).unwrap_or(now)
}

/// Run every [`PostField`] rule over `entry`.
pub fn extract_post(entry: &RawEntry, ctx: &ExtractContext<'_>) -> NormalizedPost {
    let mut post = NormalizedPost {
        feed_id: ctx.feed_id,
        guid: String::new(),
        title: NO_TITLE.to_string(),
        author: String::new(),
        link: ctx.feed_url.to_string(),
        content: String::new(),
        published_at: ctx.now,
        updated_at: ctx.now,
    };
    for field in PostField::ALL {
        field.apply(entry, ctx, &mut post);
    }
    post
}

/// `value` cut to at most `max_len` characters; zero means unlimited.
pub fn truncate(max_len: usize, value: &str) -> String {
    if max_len == 0 {
        return value.to_string();
    }
    match value.char_indices().nth(max_len) {
        Some((byte_idx, _)) => value[..byte_idx].to_string(),
        None => value.to_string(),
    }
}

fn clamp(field: &mut String, max_len: usize) {
    if max_len > 0 && field.chars().count() > max_len {
        *field = truncate(max_len, field);
    }
}

pub fn truncate_post(mut post: NormalizedPost, limits: &FieldLimits) -> NormalizedPost {
    clamp(&mut post.guid, limits.guid);
    clamp(&mut post.title, limits.title);
    clamp(&mut post.author, limits.author);
    clamp(&mut post.link, limits.link);
    clamp(&mut post.content, limits.content);
    post
}

/// Enclosures without a URL are dropped; a missing or malformed length is 0.
pub fn enclosure_from_raw(raw: &RawEnclosure, limits: &FieldLimits) -> Option<Enclosure> {
    let url = raw.url.trim();
    if url.is_empty() {
        return None;
    }
    let length = raw
        .length
        .as_deref()
        .and_then(|len| len.trim().parse::<i64>().ok())
        .unwrap_or(0);
    Some(Enclosure {
        url: truncate(limits.enclosure_url, url),
        length,
        mime_type: truncate(
            limits.enclosure_mime_type,
            raw.mime_type.as_deref().map(str::trim).unwrap_or_default(),
        ),
    })
}

pub fn category_from_raw(raw: &RawCategory, limits: &FieldLimits) -> Option<Category> {
    let name = raw.name.trim();
    if name.is_empty() {
        return None;
    }
    Some(Category {
        name: truncate(limits.category_name, name),
        domain: truncate(
            limits.category_domain,
            raw.domain.as_deref().map(str::trim).unwrap_or_default(),
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use feedsync_core::ContentBlock;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).unwrap()
    }

    fn dated(id: &str, published: Option<&str>) -> RawEntry {
        RawEntry {
            guid: Some(id.to_string()),
            published: published.map(str::to_string),
            ..Default::default()
        }
    }

    fn ids(entries: &[RawEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.guid.as_deref().unwrap()).collect()
    }

    struct FailingSummarizer;

    impl ContentSummarizer for FailingSummarizer {
        fn summarize(&self, _html: &str) -> Result<String, SummarizeError> {
            Err(SummarizeError("bad bytes".into()))
        }
    }

    fn ctx<'a>(summarizer: &'a dyn ContentSummarizer) -> ExtractContext<'a> {
        ExtractContext {
            feed_id: Uuid::nil(),
            feed_url: "https://example.com/rss",
            now: now(),
            summarizer,
        }
    }

    #[test]
    fn parses_common_feed_date_forms() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(parse_entry_date("2024-01-02T03:04:05Z"), Some(expected));
        assert_eq!(parse_entry_date("2024-01-02T05:04:05+02:00"), Some(expected));
        assert_eq!(parse_entry_date("Tue, 02 Jan 2024 03:04:05 +0000"), Some(expected));
        assert_eq!(parse_entry_date("Tue, 02 Jan 2024 03:04:05 GMT"), Some(expected));
        assert_eq!(parse_entry_date("2024-01-02 03:04:05"), Some(expected));
        assert_eq!(
            parse_entry_date("2024-01-02"),
            Some(Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap())
        );
        assert_eq!(parse_entry_date("last tuesday"), None);
        assert_eq!(parse_entry_date("   "), None);
    }

    #[test]
    fn date_priority_falls_through_malformed_fields() {
        let entry = RawEntry {
            date: Some("garbage".into()),
            updated: Some("2024-05-01T00:00:00Z".into()),
            published: Some("2020-01-01T00:00:00Z".into()),
            ..Default::default()
        };
        assert_eq!(
            resolve_entry_date(&entry, 0, now()),
            Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
        );

        let canonical_wins = RawEntry {
            date: Some("2023-01-01T00:00:00Z".into()),
            ..entry.clone()
        };
        assert_eq!(
            resolve_entry_date(&canonical_wins, 0, now()),
            Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn undated_entries_get_strictly_decreasing_timestamps() {
        let entry = RawEntry::default();
        let stamps: Vec<_> = (0..5).map(|i| resolve_entry_date(&entry, i, now())).collect();
        assert_eq!(stamps[0], now());
        for pair in stamps.windows(2) {
            assert!(pair[0] > pair[1]);
        }
    }

    #[test]
    fn orders_newest_first_and_applies_limit() {
        let entries = vec![
            dated("old", Some("2024-01-01T00:00:00Z")),
            dated("new", Some("2026-01-01T00:00:00Z")),
            dated("mid", Some("2025-01-01T00:00:00Z")),
        ];
        let ordered = order_entries(entries.clone(), None, now());
        assert_eq!(ids(&ordered), vec!["new", "mid", "old"]);

        let limited = order_entries(entries, Some(2), now());
        assert_eq!(ids(&limited), vec!["new", "mid"]);
    }

    #[test]
    fn equal_timestamps_keep_input_order() {
        let same = "2025-06-01T12:00:00Z";
        let entries = vec![
            dated("a", Some(same)),
            dated("b", Some("2025-07-01T00:00:00Z")),
            dated("c", Some(same)),
            dated("d", Some(same)),
        ];
        let first = order_entries(entries.clone(), None, now());
        assert_eq!(ids(&first), vec!["b", "a", "c", "d"]);
        assert_eq!(ids(&order_entries(entries, None, now())), ids(&first));
    }

    #[test]
    fn undated_entries_keep_feed_order() {
        let entries = vec![dated("x", None), dated("y", None), dated("z", None)];
        assert_eq!(ids(&order_entries(entries, None, now())), vec!["x", "y", "z"]);
    }

    #[test]
    fn content_prefers_blocks_then_summary_then_description() {
        let s = PassthroughSummarizer;
        let mut entry = RawEntry {
            content: vec![ContentBlock {
                value: "<p>block</p>".into(),
                content_type: None,
            }],
            summary: Some("summary".into()),
            description: Some("description".into()),
            ..Default::default()
        };
        assert_eq!(extract_content(&entry, &s), "<p>block</p>");
        entry.content.clear();
        assert_eq!(extract_content(&entry, &s), "summary");
        entry.summary = None;
        assert_eq!(extract_content(&entry, &s), "description");
        entry.description = None;
        assert_eq!(extract_content(&entry, &s), "");
    }

    #[test]
    fn summarizer_failure_empties_content_only() {
        let failing = FailingSummarizer;
        let entry = RawEntry {
            title: Some("  Kept  ".into()),
            description: Some("anything".into()),
            ..Default::default()
        };
        let post = extract_post(&entry, &ctx(&failing));
        assert_eq!(post.content, "");
        assert_eq!(post.title, "Kept");
    }

    #[test]
    fn field_defaults_for_sparse_entry() {
        let s = PassthroughSummarizer;
        let entry = RawEntry {
            guid: Some("   ".into()),
            link: Some("  ".into()),
            published: Some("not a date".into()),
            ..Default::default()
        };
        let post = extract_post(&entry, &ctx(&s));
        assert_eq!(post.guid, "");
        assert_eq!(post.title, NO_TITLE);
        assert_eq!(post.author, "");
        assert_eq!(post.link, "https://example.com/rss");
        assert_eq!(post.published_at, now());
        assert_eq!(post.updated_at, now());
    }

    #[test]
    fn each_rule_writes_only_its_field() {
        let s = PassthroughSummarizer;
        let entry = RawEntry {
            guid: Some(" g-1 ".into()),
            author: Some(" Alice ".into()),
            published: Some("2024-01-01T00:00:00Z".into()),
            ..Default::default()
        };
        let context = ctx(&s);
        let mut post = extract_post(&RawEntry::default(), &context);
        PostField::Guid.apply(&entry, &context, &mut post);
        assert_eq!(post.guid, "g-1");
        assert_eq!(post.author, "");
        PostField::Author.apply(&entry, &context, &mut post);
        assert_eq!(post.author, "Alice");
        assert_eq!(post.published_at, now());
        PostField::PublishedAt.apply(&entry, &context, &mut post);
        assert_eq!(
            post.published_at,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn html_summarizer_cuts_plain_text() {
        let s = HtmlWordSummarizer::new(3);
        assert_eq!(s.summarize("one two three four five").unwrap(), "one two three ...");
        assert_eq!(s.summarize("one  two").unwrap(), "one  two");
        assert_eq!(HtmlWordSummarizer::new(0).summarize("a b c").unwrap(), "a b c");
    }

    #[test]
    fn html_summarizer_closes_open_tags_at_the_cut() {
        let s = HtmlWordSummarizer::new(2);
        assert_eq!(
            s.summarize("<p>one <b>two three</b> four</p><p>five</p>").unwrap(),
            "<p>one <b>two ...</b></p>"
        );
    }

    #[test]
    fn html_summarizer_keeps_attributes_and_void_elements() {
        let s = HtmlWordSummarizer::new(3);
        assert_eq!(
            s.summarize(r#"<a href="/x?a=1&amp;b=2">read</a> this<br> post now please"#)
                .unwrap(),
            r#"<a href="/x?a=1&amp;b=2">read</a> this<br> post ..."#
        );
    }

    #[test]
    fn html_summarizer_leaves_short_markup_untouched() {
        let s = HtmlWordSummarizer::new(5);
        let html = "<p>Short &amp; <!-- note --> sweet</p>";
        assert_eq!(s.summarize(html).unwrap(), html);
    }

    #[test]
    fn truncate_bounds_length_and_is_idempotent() {
        let text = "héllo wörld";
        let cut = truncate(5, text);
        assert_eq!(cut, "héllo");
        assert_eq!(truncate(5, &cut), cut);
        assert_eq!(truncate(0, text), text);
        assert_eq!(truncate(100, text), text);
        for max in 1..15 {
            assert!(truncate(max, text).chars().count() <= max);
        }
    }

    #[test]
    fn truncate_post_applies_limits_to_every_text_field() {
        let limits = FieldLimits {
            guid: 2,
            title: 3,
            author: 4,
            link: 5,
            content: 6,
            ..FieldLimits::default()
        };
        let post = NormalizedPost {
            feed_id: Uuid::nil(),
            guid: "guid-long".into(),
            title: "title-long".into(),
            author: "author-long".into(),
            link: "https://x".into(),
            content: "content-long".into(),
            published_at: now(),
            updated_at: now(),
        };
        let cut = truncate_post(post, &limits);
        assert_eq!(cut.guid, "gu");
        assert_eq!(cut.title, "tit");
        assert_eq!(cut.author, "auth");
        assert_eq!(cut.link, "https");
        assert_eq!(cut.content, "conten");
        assert_eq!(truncate_post(cut.clone(), &limits), cut);
    }

    #[test]
    fn attachments_normalize_and_skip_blank_keys() {
        let limits = FieldLimits::default();
        let enclosure = enclosure_from_raw(
            &RawEnclosure {
                url: " https://example.com/a.mp3 ".into(),
                length: Some("n/a".into()),
                mime_type: None,
            },
            &limits,
        )
        .unwrap();
        assert_eq!(enclosure.url, "https://example.com/a.mp3");
        assert_eq!(enclosure.length, 0);
        assert_eq!(enclosure.mime_type, "");
        assert!(enclosure_from_raw(&RawEnclosure::default(), &limits).is_none());

        let category = category_from_raw(
            &RawCategory {
                name: " rust ".into(),
                domain: Some(" tags ".into()),
            },
            &limits,
        )
        .unwrap();
        assert_eq!(category.name, "rust");
        assert_eq!(category.domain, "tags");
        assert!(category_from_raw(&RawCategory::default(), &limits).is_none());
    }
}
