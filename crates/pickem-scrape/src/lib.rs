//! Source adapters that turn third-party listing and card HTML into
//! event stubs and match lists.

use std::collections::HashSet;
use std::sync::OnceLock;

use async_trait::async_trait;
use pickem_core::{EventMatch, EventStub};
use pickem_store::{FetchError, HttpFetcher};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "pickem-scrape";

/// Cagematch promotion ids for the promotions we list: WWE, TNA/Impact,
/// NJPW, ROH, AEW.
pub const MAJOR_PROMOTION_IDS: [u32; 5] = [1, 4, 7, 11, 2287];

const MAJOR_PROMOTION_NAMES: [&str; 3] = ["wwe", "aew", "njpw"];

/// Allow-list gate from the listing parser contract: a fixed id set, or a
/// promotion name that names one of the big three.
pub fn promotion_allowed(promotion_id: u32, promotion_name: &str) -> bool {
    if MAJOR_PROMOTION_IDS.contains(&promotion_id) {
        return true;
    }
    let lower = promotion_name.to_lowercase();
    MAJOR_PROMOTION_NAMES.iter().any(|n| lower.contains(n))
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{0}")]
    Message(String),
}

/// One external event database. Parsing is pure: malformed HTML yields
/// zero stubs or matches, never an error.
#[async_trait]
pub trait EventSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Card-page URL for a stub emitted by this source's listing parser.
    fn event_url(&self, stub: &EventStub) -> String;

    fn parse_listing(&self, html: &str) -> Vec<EventStub>;

    fn parse_matches(&self, html: &str) -> Vec<EventMatch>;

    async fn fetch_page(
        &self,
        http: &HttpFetcher,
        run_id: Uuid,
        url: &str,
    ) -> Result<String, AdapterError> {
        let page = http.fetch_text(run_id, self.source_id(), url).await?;
        Ok(page.body)
    }
}

fn sel(css: &str) -> Selector {
    Selector::parse(css).unwrap_or_else(|e| panic!("invalid selector {css}: {e}"))
}

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

fn first_capture_u64(regex: &Regex, haystack: &str) -> Option<u64> {
    regex
        .captures(haystack)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Split `"A vs. B"` (also `"vs"`, `"&"`-joined teams stay whole) into the
/// two sides of a match.
fn split_versus(text: &str) -> Option<(String, String)> {
    for sep in [" vs. ", " vs ", " Vs. ", " VS "] {
        if let Some((a, b)) = text.split_once(sep) {
            let a = a.trim();
            let b = b.trim();
            if !a.is_empty() && !b.is_empty() {
                return Some((a.to_string(), b.to_string()));
            }
        }
    }
    None
}

/// cagematch.net: listing rows carry a date cell, a promotion logo link
/// (`?id=8&nr=<promotion>`) and an event link (`?id=1&nr=<event>`).
#[derive(Debug, Clone, Copy, Default)]
pub struct CagematchSource;

fn cagematch_event_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[?&]id=1&nr=(\d+)").expect("event id regex"))
}

fn cagematch_promotion_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[?&]id=8&nr=(\d+)").expect("promotion id regex"))
}

#[async_trait]
impl EventSource for CagematchSource {
    fn source_id(&self) -> &'static str {
        "cagematch"
    }

    fn event_url(&self, stub: &EventStub) -> String {
        format!(
            "https://www.cagematch.net/?id=1&nr={}&page=2",
            stub.source_event_id
        )
    }

    fn parse_listing(&self, html: &str) -> Vec<EventStub> {
        let document = Html::parse_document(html);
        let row_sel = sel("tr");
        let cell_sel = sel("td");
        let link_sel = sel("a[href]");
        let logo_sel = sel("img");
        let mut seen: HashSet<u64> = HashSet::new();
        let mut stubs = Vec::new();

        for row in document.select(&row_sel) {
            let cells: Vec<ElementRef<'_>> = row.select(&cell_sel).collect();
            if cells.len() < 3 {
                continue;
            }

            let mut event_id = None;
            let mut event_name = String::new();
            let mut promotion_id = 0u32;
            let mut promotion_name = String::new();

            for link in row.select(&link_sel) {
                let href = link.value().attr("href").unwrap_or_default();
                if let Some(id) = first_capture_u64(cagematch_event_id_re(), href) {
                    event_id = Some(id);
                    event_name = element_text(link);
                } else if let Some(id) = first_capture_u64(cagematch_promotion_id_re(), href) {
                    promotion_id = id as u32;
                    let logo_title = link
                        .select(&logo_sel)
                        .next()
                        .and_then(|img| img.value().attr("title"))
                        .map(str::trim)
                        .unwrap_or_default();
                    promotion_name = if logo_title.is_empty() {
                        element_text(link)
                    } else {
                        logo_title.to_string()
                    };
                }
            }

            let Some(event_id) = event_id else { continue };
            if event_name.is_empty() || !seen.insert(event_id) {
                continue;
            }
            if !promotion_allowed(promotion_id, &promotion_name) {
                continue;
            }

            stubs.push(EventStub {
                id: format!("cagematch-{event_id}"),
                source_event_id: event_id,
                promotion_id,
                promotion_name,
                name: event_name,
                date: element_text(cells[0]),
            });
        }

        stubs
    }

    fn parse_matches(&self, html: &str) -> Vec<EventMatch> {
        let document = Html::parse_document(html);
        let block_sel = sel("div.Match");
        let type_sel = sel("div.MatchType");
        let results_sel = sel("div.MatchResults");
        let mut matches = Vec::new();

        for block in document.select(&block_sel) {
            let title = block
                .select(&type_sel)
                .next()
                .map(element_text)
                .filter(|t| !t.is_empty());
            let Some(results) = block.select(&results_sel).next() else {
                continue;
            };
            let Some((side_a, side_b)) = split_versus(&element_text(results)) else {
                continue;
            };
            matches.push(EventMatch {
                id: matches.len() as u32 + 1,
                side_a,
                side_b,
                title,
            });
        }

        matches
    }
}

/// profightdb.com: upcoming-cards table with date, promotion and a card
/// link shaped like `cards/<slug>-no-<id>.html`. The site has no numeric
/// promotion ids, so known promotion names map onto the canonical ids.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProfightDbSource;

fn profightdb_card_id_re() -> &'static Regex {
    // Promotion links share the `-no-<id>.html` suffix; only card links
    // live under `cards/`.
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"cards/[^\s]+-no-(\d+)\.html").expect("card id regex"))
}

fn canonical_promotion_id(name: &str) -> u32 {
    let lower = name.to_lowercase();
    if lower.contains("wwe") {
        1
    } else if lower.contains("tna") || lower.contains("impact") {
        4
    } else if lower.contains("njpw") || lower.contains("new japan") {
        7
    } else if lower.contains("roh") || lower.contains("ring of honor") {
        11
    } else if lower.contains("aew") {
        2287
    } else {
        0
    }
}

fn slugify(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

#[async_trait]
impl EventSource for ProfightDbSource {
    fn source_id(&self) -> &'static str {
        "profightdb"
    }

    fn event_url(&self, stub: &EventStub) -> String {
        format!(
            "https://www.profightdb.com/cards/{}-no-{}.html",
            slugify(&stub.name),
            stub.source_event_id
        )
    }

    fn parse_listing(&self, html: &str) -> Vec<EventStub> {
        let document = Html::parse_document(html);
        let row_sel = sel("tr");
        let cell_sel = sel("td");
        let link_sel = sel("a[href]");
        let mut seen: HashSet<u64> = HashSet::new();
        let mut stubs = Vec::new();

        for row in document.select(&row_sel) {
            let cells: Vec<ElementRef<'_>> = row.select(&cell_sel).collect();
            if cells.len() < 3 {
                continue;
            }

            let Some(card_link) = row
                .select(&link_sel)
                .find(|a| profightdb_card_id_re().is_match(a.value().attr("href").unwrap_or_default()))
            else {
                continue;
            };
            let Some(card_id) = first_capture_u64(
                profightdb_card_id_re(),
                card_link.value().attr("href").unwrap_or_default(),
            ) else {
                continue;
            };

            let name = element_text(card_link);
            let promotion_name = element_text(cells[1]);
            let promotion_id = canonical_promotion_id(&promotion_name);

            if name.is_empty() || !seen.insert(card_id) {
                continue;
            }
            if !promotion_allowed(promotion_id, &promotion_name) {
                continue;
            }

            stubs.push(EventStub {
                id: format!("profightdb-{card_id}"),
                source_event_id: card_id,
                promotion_id,
                promotion_name,
                name,
                date: element_text(cells[0]),
            });
        }

        stubs
    }

    fn parse_matches(&self, html: &str) -> Vec<EventMatch> {
        let document = Html::parse_document(html);
        let row_sel = sel("table.matches tr");
        let cell_sel = sel("td");
        let mut matches = Vec::new();

        for row in document.select(&row_sel) {
            let cells: Vec<ElementRef<'_>> = row.select(&cell_sel).collect();
            if cells.len() < 3 {
                continue;
            }
            let side_a = element_text(cells[0]);
            let side_b = element_text(cells[2]);
            if side_a.is_empty() || side_b.is_empty() {
                continue;
            }
            let title = cells.get(3).map(|c| element_text(*c)).filter(|t| !t.is_empty());
            matches.push(EventMatch {
                id: matches.len() as u32 + 1,
                side_a,
                side_b,
                title,
            });
        }

        matches
    }
}

pub fn source_for_id(source_id: &str) -> Option<Box<dyn EventSource>> {
    match source_id {
        "cagematch" => Some(Box::new(CagematchSource)),
        "profightdb" => Some(Box::new(ProfightDbSource)),
        _ => None,
    }
}
