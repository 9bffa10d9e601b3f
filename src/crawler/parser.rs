//! Document extraction for list, detail and item pages
//!
//! This module turns a fetched page into typed records:
//! - List pages yield [`ListingEntry`] rows
//! - Detail pages yield a [`DetailRecord`] (metadata plus the item index)
//! - Item pages yield an [`ItemRecord`]
//!
//! Detail and item pages carry their structured data in an embedded
//! `#__NEXT_DATA__` JSON document. A page without a usable payload is a
//! [`Extraction::Skip`], which is not an error. A payload that is present but
//! cannot be decoded is a malformed [`FetchError`].

use crate::crawler::{FetchError, RawDocument};
use crate::state::{DetailRecord, ItemIndexEntry, ItemRecord, ListingEntry, TargetMetadata};
use chrono::{DateTime, NaiveDate, Utc};
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use url::Url;

const LOGIN_WALL_MARKER: &str = "You need to login";

/// Outcome of extracting one record
#[derive(Debug, Clone, PartialEq)]
pub enum Extraction<T> {
    Record(T),

    /// The page is not a usable record (the reason is logged and tracked)
    Skip(String),
}

/// Field-extraction boundary of the pipeline
pub trait Extractor: Send + Sync {
    /// Extracts catalog rows from one list page, resolving links against `base`
    fn extract_listing(&self, doc: &RawDocument, base: &Url) -> Result<Vec<ListingEntry>, FetchError>;

    fn extract_detail(&self, doc: &RawDocument) -> Result<Extraction<DetailRecord>, FetchError>;

    fn extract_item(&self, doc: &RawDocument) -> Result<Extraction<ItemRecord>, FetchError>;
}

/// [`Extractor`] for catalog pages rendered with an embedded data payload
#[derive(Debug, Clone, Default)]
pub struct NextDataExtractor;

impl NextDataExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl Extractor for NextDataExtractor {
    fn extract_listing(&self, doc: &RawDocument, base: &Url) -> Result<Vec<ListingEntry>, FetchError> {
        let document = Html::parse_document(&doc.body);
        let row_selector = selector(".serie-item")?;
        let title_selector = selector(".title")?;
        let detail_selector = selector(".detail-item span")?;

        let mut entries = Vec::new();
        for row in document.select(&row_selector) {
            let Some(href) = row
                .select(&title_selector)
                .next()
                .and_then(|el| el.value().attr("href"))
            else {
                continue;
            };
            let Ok(url) = base.join(href.trim()) else {
                tracing::debug!("Skipping unresolvable listing link: {}", href);
                continue;
            };

            let spans: Vec<String> = row.select(&detail_selector).map(element_text).collect();
            let status = spans
                .first()
                .map(|s| s.to_lowercase())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "unknown".to_string());
            let total_items = spans.get(1).map(|s| leading_number(s)).unwrap_or(0);

            entries.push(ListingEntry {
                url: url.to_string(),
                total_items,
                status,
            });
        }

        Ok(entries)
    }

    fn extract_detail(&self, doc: &RawDocument) -> Result<Extraction<DetailRecord>, FetchError> {
        let document = Html::parse_document(&doc.body);

        let Some(data) = next_data(&document)? else {
            return Ok(Extraction::Skip("no embedded data payload".to_string()));
        };

        let mut items: Vec<ItemIndexEntry> = data
            .pointer("/props/pageProps/serie/chapters")
            .and_then(Value::as_array)
            .map(|chapters| {
                chapters
                    .iter()
                    .filter_map(|c| {
                        let index = c.get("order")?.as_u64()?;
                        let title = c.get("title").and_then(Value::as_str).unwrap_or_default();
                        Some(ItemIndexEntry {
                            index: u32::try_from(index).ok()?,
                            title: title.trim().to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        if items.is_empty() {
            return Ok(Extraction::Skip("empty item list".to_string()));
        }
        items.sort_by_key(|i| i.index);

        if first_text(&document.root_element(), ".alert-warning")
            .map(|t| t.contains(LOGIN_WALL_MARKER))
            .unwrap_or(false)
        {
            return Ok(Extraction::Skip("login required".to_string()));
        }

        let root = document.root_element();
        let detail_selector = selector(".detail-item span")?;
        let spans: Vec<String> = document.select(&detail_selector).map(element_text).collect();

        let declared = spans.get(1).map(|s| leading_number(s)).unwrap_or(0);
        let total_count = if declared > 0 {
            declared
        } else {
            items.len() as u32
        };

        let mut metadata = TargetMetadata {
            title: first_text(&root, "h1").unwrap_or_default(),
            original_title: first_text(&root, "h1 + h3").unwrap_or_default(),
            status: spans.first().map(|s| s.to_lowercase()).unwrap_or_default(),
            summary: first_text(&root, ".lead").unwrap_or_default(),
            image_url: first_attr(&root, ".img-wrap img", "src").unwrap_or_default(),
            ..TargetMetadata::default()
        };
        read_info_table(&document, &mut metadata)?;

        Ok(Extraction::Record(DetailRecord {
            total_count,
            metadata,
            items,
        }))
    }

    fn extract_item(&self, doc: &RawDocument) -> Result<Extraction<ItemRecord>, FetchError> {
        let document = Html::parse_document(&doc.body);

        let Some(data) = next_data(&document)? else {
            return Ok(Extraction::Skip("no embedded data payload".to_string()));
        };
        let Some(item) = data.pointer("/props/pageProps/serie/chapter_data/data") else {
            return Ok(Extraction::Skip("no item payload".to_string()));
        };
        let Some(paragraphs) = item.get("body").and_then(Value::as_array) else {
            return Ok(Extraction::Skip("item body is not a paragraph list".to_string()));
        };

        let content = paragraphs
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| format!("<p>{}</p>", p))
            .collect::<Vec<_>>()
            .join("\n");
        if content.is_empty() {
            return Ok(Extraction::Skip("empty item body".to_string()));
        }

        let title = item
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string();

        Ok(Extraction::Record(ItemRecord { title, content }))
    }
}

/// Reads the author/genre/tag/date rows of the info table
fn read_info_table(document: &Html, metadata: &mut TargetMetadata) -> Result<(), FetchError> {
    let row_selector = selector(".custom-table tr")?;
    let cell_selector = selector("td")?;
    let link_selector = selector("a")?;
    let genre_selector = selector(".genre")?;
    let tag_selector = selector(".tag")?;

    for row in document.select(&row_selector) {
        let cells: Vec<ElementRef> = row.select(&cell_selector).collect();
        let (Some(label), Some(value)) = (cells.first(), cells.last()) else {
            continue;
        };

        match element_text(*label).as_str() {
            "Author" => {
                metadata.author = value
                    .select(&link_selector)
                    .map(element_text)
                    .filter(|a| !a.is_empty())
                    .collect::<Vec<_>>()
                    .join(", ");
            }
            "Genre" => metadata.genre = list_text(&row, &genre_selector, false),
            "Tags" => metadata.tags = list_text(&row, &tag_selector, true),
            "Addition Date" => metadata.addition_date = parse_addition_date(&element_text(*value)),
            _ => {}
        }
    }
    Ok(())
}

fn list_text(row: &ElementRef, sel: &Selector, lowercase: bool) -> Vec<String> {
    row.select(sel)
        .map(|el| {
            let text = element_text(el).replace(',', "").trim().to_string();
            if lowercase {
                text.to_lowercase()
            } else {
                text
            }
        })
        .filter(|t| !t.is_empty())
        .collect()
}

/// Finds and decodes the embedded `#__NEXT_DATA__` document
///
/// `Ok(None)` when the script is absent or empty.
fn next_data(document: &Html) -> Result<Option<Value>, FetchError> {
    let script_selector = selector("script#__NEXT_DATA__")?;
    let Some(script) = document.select(&script_selector).next() else {
        return Ok(None);
    };

    let raw: String = script.text().collect();
    if raw.trim().is_empty() {
        return Ok(None);
    }

    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|e| FetchError::malformed(format!("embedded data payload: {}", e)))
}

/// Parses dates such as `December 4, 2024`
fn parse_addition_date(text: &str) -> Option<DateTime<Utc>> {
    NaiveDate::parse_from_str(text.trim(), "%B %d, %Y")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// Parses the leading digits of strings such as `120 Chapters`
fn leading_number(text: &str) -> u32 {
    let digits: String = text
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == ',')
        .filter(|c| c.is_ascii_digit())
        .collect();
    digits.parse().unwrap_or(0)
}

fn selector(css: &str) -> Result<Selector, FetchError> {
    Selector::parse(css).map_err(|e| FetchError::other(format!("invalid selector '{}': {:?}", css, e)))
}

fn element_text(element: ElementRef) -> String {
    element.text().collect::<String>().trim().to_string()
}

fn first_text(scope: &ElementRef, css: &str) -> Option<String> {
    let sel = Selector::parse(css).ok()?;
    scope
        .select(&sel)
        .next()
        .map(element_text)
        .filter(|s| !s.is_empty())
}

fn first_attr(scope: &ElementRef, css: &str, attr: &str) -> Option<String> {
    let sel = Selector::parse(css).ok()?;
    scope
        .select(&sel)
        .next()
        .and_then(|el| el.value().attr(attr))
        .map(|s| s.to_string())
}
