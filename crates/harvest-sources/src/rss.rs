//! RSS 2.0 feeds: every entry is an item keyed by guid, link or title + date.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvest_core::{item_id, DryRunResult, UpsertDecision};
use harvest_storage::HttpProfile;
use harvest_sync::{check_response, DryRunProbe, ExecutionContext, Fetcher, ItemError, RunBody};
use quick_xml::de::from_str;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{SourceConfigError, SourceMeta};

#[derive(Debug, Clone, Deserialize)]
pub struct RssConfig {
    pub feeds: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    items: Vec<Item>,
}

#[derive(Debug, Deserialize)]
struct Item {
    title: Option<String>,
    link: Option<String>,
    guid: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    description: Option<String>,
}

/// What gets stored and hashed for one entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedEntry {
    pub feed: String,
    pub natural_key: String,
    pub title: Option<String>,
    pub link: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub description: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn natural_key(item: &Item) -> Option<String> {
    if let Some(guid) = non_empty(item.guid.clone()) {
        return Some(guid);
    }
    if let Some(link) = non_empty(item.link.clone()) {
        return Some(link);
    }
    let title = non_empty(item.title.clone())?;
    Some(match non_empty(item.pub_date.clone()) {
        Some(date) => format!("{title}|{date}"),
        None => title,
    })
}

/// Parses a feed document. Entries with no usable identity are returned as errors
/// so the caller can count them as failed.
pub fn parse_feed(feed: &str, xml: &str) -> Result<Vec<Result<FeedEntry, ItemError>>, ItemError> {
    let rss: Rss = from_str(xml).map_err(|err| ItemError::parse(feed, err))?;
    Ok(rss
        .channel
        .items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            let key = natural_key(&item).ok_or_else(|| {
                ItemError::parse(format!("{feed}#{index}"), "entry has no guid, link or title")
            })?;
            Ok(FeedEntry {
                feed: feed.to_string(),
                natural_key: key,
                title: non_empty(item.title),
                link: non_empty(item.link),
                published_at: item
                    .pub_date
                    .as_deref()
                    .and_then(|d| DateTime::parse_from_rfc2822(d.trim()).ok())
                    .map(|d| d.with_timezone(&Utc)),
                description: non_empty(item.description),
            })
        })
        .collect())
}

pub fn last_sync_key(feed: &str) -> String {
    format!("last_sync:{feed}")
}

pub struct RssFetcher {
    meta: SourceMeta,
    feeds: Vec<String>,
}

impl RssFetcher {
    pub fn new(meta: SourceMeta, config: RssConfig) -> Result<Self, SourceConfigError> {
        if config.feeds.is_empty() {
            return Err(SourceConfigError::Empty {
                name: meta.name,
                what: "feeds",
            });
        }
        Ok(Self {
            meta,
            feeds: config.feeds,
        })
    }

    async fn sync_feed(&self, ctx: &ExecutionContext, feed: &str) -> Result<(), ItemError> {
        let started = Utc::now();
        let xml = check_response(ctx.http().get(feed).await?)?.text().await?;
        let entries = parse_feed(feed, &xml)?;
        debug!(feed, entries = entries.len(), "parsed feed");

        for entry in entries {
            ctx.mark_attempted();
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    ctx.fail_item(&err, feed);
                    continue;
                }
            };
            ctx.mark_fetched();
            let body = serde_json::to_string(&entry).map_err(ItemError::storage)?;
            match ctx.upsert_raw(&item_id(&entry.natural_key), &body, "json").await {
                Ok(UpsertDecision::New) => ctx.mark_new(1),
                Ok(UpsertDecision::Updated) => ctx.mark_updated(1),
                Ok(UpsertDecision::Unchanged) => ctx.mark_skipped(),
                Err(err) => ctx.fail_item(&err, &entry.natural_key),
            }
        }

        ctx.checkpoint()
            .set_datetime(&last_sync_key(feed), started)
            .await
    }
}

#[async_trait]
impl RunBody for RssFetcher {
    async fn run(&self, ctx: &ExecutionContext) -> anyhow::Result<()> {
        for (position, feed) in self.feeds.iter().enumerate() {
            match self.sync_feed(ctx, feed).await {
                Ok(()) => {}
                Err(err) if err.is_rate_limited() => {
                    // This feed and the ones after it wait for the next run.
                    info!(feed, error = %err, "rate limited; stopping this run");
                    ctx.defer_remaining((self.feeds.len() - position) as u64, feed);
                    break;
                }
                Err(err) => ctx.fail_item(&err, feed),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Fetcher for RssFetcher {
    fn name(&self) -> &str {
        &self.meta.name
    }

    fn version(&self) -> &str {
        "1"
    }

    fn category(&self) -> &str {
        &self.meta.category
    }

    fn http_profile(&self) -> HttpProfile {
        self.meta.profile.clone()
    }

    fn schedule(&self) -> Option<&str> {
        self.meta.schedule.as_deref()
    }

    async fn dry_run(&self, probe: &DryRunProbe) -> DryRunResult {
        let mut result = DryRunResult::new(self.name());
        for feed in &self.feeds {
            result.push(probe.check_url("feed reachable", feed).await);
        }
        for check in probe.standard_checks().await {
            result.push(check);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_core::ErrorKind;

    const FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>Press releases</title>
    <item>
      <title>Rates held</title>
      <link>https://example.org/press/1</link>
      <guid>press-1</guid>
      <pubDate>Tue, 05 Mar 2024 14:00:00 GMT</pubDate>
      <description>The committee held rates.</description>
    </item>
    <item>
      <title>Minutes published</title>
      <link>https://example.org/press/2</link>
    </item>
    <item>
      <title>Speech</title>
      <pubDate>Wed, 06 Mar 2024 09:30:00 GMT</pubDate>
    </item>
    <item>
      <description>orphan</description>
    </item>
  </channel>
</rss>"#;

    #[test]
    fn identity_prefers_guid_then_link_then_title_and_date() {
        let entries = parse_feed("https://example.org/feed.xml", FEED).unwrap();
        assert_eq!(entries.len(), 4);

        let keys: Vec<_> = entries
            .iter()
            .filter_map(|e| e.as_ref().ok())
            .map(|e| e.natural_key.as_str())
            .collect();
        assert_eq!(
            keys,
            vec![
                "press-1",
                "https://example.org/press/2",
                "Speech|Wed, 06 Mar 2024 09:30:00 GMT"
            ]
        );

        let first = entries[0].as_ref().unwrap();
        assert_eq!(
            first.published_at.unwrap().to_rfc3339(),
            "2024-03-05T14:00:00+00:00"
        );
        assert_eq!(entries[3].as_ref().unwrap_err().kind(), ErrorKind::ParseError);
    }

    #[test]
    fn empty_channel_parses_to_nothing() {
        let xml = r#"<rss version="2.0"><channel><title>quiet</title></channel></rss>"#;
        assert!(parse_feed("f", xml).unwrap().is_empty());
    }

    #[test]
    fn malformed_xml_is_a_parse_error() {
        let err = parse_feed("f", "<rss><channel>").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ParseError);
    }
}
