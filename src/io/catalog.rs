//! OPERA DISP granule search and deduplication

use crate::config::PipelineConfig;
use crate::types::{within_one_day, DatePair, DispError, DispResult, OrbitPass};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Response header CMR uses to hand out the next page
pub const SEARCH_AFTER_HEADER: &str = "CMR-Search-After";

/// One displacement product for one frame
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Granule {
    pub scene_name: String,
    pub frame_id: u32,
    pub orbit_pass: OrbitPass,
    pub url: String,
    pub s3_uri: String,
    pub reference_date: DateTime<Utc>,
    pub secondary_date: DateTime<Utc>,
    pub creation_date: DateTime<Utc>,
}

impl Granule {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        scene_name: impl Into<String>,
        frame_id: u32,
        orbit_pass: OrbitPass,
        url: impl Into<String>,
        s3_uri: impl Into<String>,
        reference_date: DateTime<Utc>,
        secondary_date: DateTime<Utc>,
        creation_date: DateTime<Utc>,
    ) -> DispResult<Self> {
        let scene_name = scene_name.into();
        if reference_date >= secondary_date {
            return Err(DispError::InvalidFormat(format!(
                "Granule {} has reference date {} not before secondary date {}",
                scene_name, reference_date, secondary_date
            )));
        }
        Ok(Self {
            scene_name,
            frame_id,
            orbit_pass,
            url: url.into(),
            s3_uri: s3_uri.into(),
            reference_date,
            secondary_date,
            creation_date,
        })
    }

    /// Build a granule from a CMR UMM JSON search item
    pub fn from_umm(item: &UmmItem) -> DispResult<Self> {
        let umm = &item.umm;
        let frame_id = umm
            .attribute("FRAME_NUMBER")
            .ok_or_else(|| DispError::InvalidFormat(format!("{} has no FRAME_NUMBER", item.meta.native_id)))?
            .parse::<u32>()
            .map_err(|e| DispError::InvalidFormat(format!("Bad FRAME_NUMBER for {}: {}", item.meta.native_id, e)))?;
        let orbit_pass = umm
            .attribute("ASCENDING_DESCENDING")
            .ok_or_else(|| {
                DispError::InvalidFormat(format!("{} has no ASCENDING_DESCENDING", item.meta.native_id))
            })?
            .parse::<OrbitPass>()?;

        Self::new(
            item.meta.native_id.clone(),
            frame_id,
            orbit_pass,
            umm.related_url("GET DATA")?,
            umm.related_url("GET DATA VIA DIRECT ACCESS")?,
            umm.temporal_extent.range_date_time.beginning_date_time,
            umm.temporal_extent.range_date_time.ending_date_time,
            umm.data_granule.production_date_time,
        )
    }

    /// Whether `other` is a reprocessing of the same observation
    pub fn is_duplicate_of(&self, other: &Granule) -> bool {
        self.frame_id == other.frame_id
            && within_one_day(self.reference_date, other.reference_date)
            && within_one_day(self.secondary_date, other.secondary_date)
    }

    fn identity(&self) -> (u32, DateTime<Utc>, DateTime<Utc>, DateTime<Utc>) {
        (self.frame_id, self.reference_date, self.secondary_date, self.creation_date)
    }

    fn sort_key(&self) -> (u32, DateTime<Utc>, DateTime<Utc>, DateTime<Utc>, &str) {
        (
            self.frame_id,
            self.secondary_date,
            self.reference_date,
            self.creation_date,
            self.scene_name.as_str(),
        )
    }
}

impl DatePair for Granule {
    fn reference_date(&self) -> DateTime<Utc> {
        self.reference_date
    }

    fn secondary_date(&self) -> DateTime<Utc> {
        self.secondary_date
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UmmSearchResponse {
    #[serde(default)]
    pub items: Vec<UmmItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UmmItem {
    pub meta: UmmMeta,
    pub umm: Umm,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UmmMeta {
    #[serde(rename = "native-id")]
    pub native_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Umm {
    pub temporal_extent: TemporalExtent,
    #[serde(default)]
    pub additional_attributes: Vec<AdditionalAttribute>,
    #[serde(default)]
    pub related_urls: Vec<RelatedUrl>,
    pub data_granule: DataGranule,
}

impl Umm {
    fn attribute(&self, name: &str) -> Option<&str> {
        self.additional_attributes
            .iter()
            .find(|a| a.name == name)
            .and_then(|a| a.values.first())
            .map(String::as_str)
    }

    fn related_url(&self, kind: &str) -> DispResult<String> {
        self.related_urls
            .iter()
            .find(|u| u.kind == kind)
            .map(|u| u.url.clone())
            .ok_or_else(|| DispError::InvalidFormat(format!("No related URL of type {}", kind)))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TemporalExtent {
    pub range_date_time: RangeDateTime,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RangeDateTime {
    pub beginning_date_time: DateTime<Utc>,
    pub ending_date_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AdditionalAttribute {
    pub name: String,
    #[serde(default)]
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelatedUrl {
    #[serde(rename = "URL")]
    pub url: String,
    #[serde(rename = "Type")]
    pub kind: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DataGranule {
    pub production_date_time: DateTime<Utc>,
}

/// Anything that can list the full granule history of a frame
pub trait GranuleSource {
    fn find_granules_for_frame(&self, frame_id: u32) -> DispResult<Vec<Granule>>;
}

/// CMR granule search client
pub struct CmrClient {
    client: reqwest::blocking::Client,
    endpoint: String,
    short_name: String,
    version: f64,
}

impl CmrClient {
    pub fn new(config: &PipelineConfig) -> DispResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .user_agent(concat!("opera_disp_tms/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            endpoint: config.cmr_endpoint.clone(),
            short_name: config.short_name.clone(),
            version: config.product_version,
        })
    }

    fn search_parameters(&self, frame_id: u32) -> Vec<(&'static str, String)> {
        vec![
            ("short_name", self.short_name.clone()),
            ("attribute[]", format!("int,FRAME_NUMBER,{}", frame_id)),
            ("attribute[]", format!("float,PRODUCT_VERSION,{:.1}", self.version)),
            ("page_size", "2000".to_string()),
        ]
    }

    /// Fetch every UMM item for a frame, following CMR-Search-After
    pub fn get_cmr_metadata(&self, frame_id: u32) -> DispResult<Vec<UmmItem>> {
        let params = self.search_parameters(frame_id);
        let mut items = Vec::new();
        let mut search_after: Option<String> = None;

        loop {
            let mut request = self.client.post(&self.endpoint).form(&params);
            if let Some(token) = &search_after {
                request = request.header(SEARCH_AFTER_HEADER, token);
            }

            let response = request.send()?.error_for_status()?;
            let next = response
                .headers()
                .get(SEARCH_AFTER_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let page: UmmSearchResponse = response.json()?;
            let page_len = page.items.len();
            log::debug!("CMR page for frame {}: {} items", frame_id, page_len);
            items.extend(page.items);

            match next {
                Some(token) if page_len > 0 => search_after = Some(token),
                _ => break,
            }
        }

        Ok(items)
    }
}

impl GranuleSource for CmrClient {
    fn find_granules_for_frame(&self, frame_id: u32) -> DispResult<Vec<Granule>> {
        let items = self.get_cmr_metadata(frame_id)?;
        let granules = items.iter().map(Granule::from_umm).collect::<DispResult<Vec<_>>>()?;
        log::debug!("Found {} catalog entries for frame {}", granules.len(), frame_id);
        Ok(granules)
    }
}

/// In-memory granule list, typically loaded from a cache file
#[derive(Debug, Clone, Default)]
pub struct StaticGranules {
    granules: Vec<Granule>,
}

impl StaticGranules {
    pub fn new(granules: Vec<Granule>) -> Self {
        Self { granules }
    }

    pub fn from_cache_file<P: AsRef<Path>>(path: P) -> DispResult<Self> {
        Ok(Self::new(read_granule_cache(path)?))
    }
}

impl GranuleSource for StaticGranules {
    fn find_granules_for_frame(&self, frame_id: u32) -> DispResult<Vec<Granule>> {
        Ok(self.granules.iter().filter(|g| g.frame_id == frame_id).cloned().collect())
    }
}

/// Remove reprocessed copies, keeping the most recently created granule
///
/// The result is sorted, so it does not depend on input order.
pub fn eliminate_duplicates(granules: &[Granule]) -> Vec<Granule> {
    let mut candidates: Vec<Granule> = granules.to_vec();
    candidates.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    candidates.dedup_by(|a, b| a.identity() == b.identity());

    // Latest creation first so ties resolve against already retained granules
    let mut by_creation: Vec<&Granule> = candidates.iter().collect();
    by_creation.sort_by(|a, b| b.creation_date.cmp(&a.creation_date).then_with(|| a.sort_key().cmp(&b.sort_key())));

    let mut retained: Vec<Granule> = Vec::new();
    for candidate in by_creation {
        let superseded = retained.iter().any(|kept| kept.is_duplicate_of(candidate));
        let newer_exists = candidates
            .iter()
            .any(|other| other.is_duplicate_of(candidate) && other.creation_date > candidate.creation_date);
        if !superseded && !newer_exists {
            retained.push(candidate.clone());
        }
    }

    retained.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    retained
}

/// Write a granule list to a JSON cache file
pub fn write_granule_cache<P: AsRef<Path>>(path: P, granules: &[Granule]) -> DispResult<()> {
    log::info!("Writing {} granules to {}", granules.len(), path.as_ref().display());
    let content = serde_json::to_string_pretty(granules)?;
    std::fs::write(path.as_ref(), content)?;
    Ok(())
}

/// Read a granule list written by [`write_granule_cache`]
pub fn read_granule_cache<P: AsRef<Path>>(path: P) -> DispResult<Vec<Granule>> {
    let content = std::fs::read_to_string(path.as_ref())?;
    let granules: Vec<Granule> = serde_json::from_str(&content)?;
    log::debug!("Read {} granules from {}", granules.len(), path.as_ref().display());
    Ok(granules)
}
