use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use reqwest::blocking::Client;
use tracing::info;

use crate::domain::AccessionId;
use crate::error::RepoError;
use crate::fs_util::unlink_if_exists;
use crate::info::ValidationInfo;
use crate::pipeline::DownloadUnit;
use crate::providers::{PayloadKind, Provider, fetch_text, metadata_client};
use crate::toolkit::Toolkit;

pub const ENTREZ_LABEL: &str = "NCBI/Entrez";
const EUTILS_BASE: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils";

static SRA_FILE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<SRAFile\b([^>]*)>").expect("valid SRAFile pattern"));
static RUN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<RUN\b([^>]*)>").expect("valid RUN pattern"));
static ATTR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"([\w:]+)="([^"]*)""#).expect("valid attribute pattern"));

/// Sample metadata keys and the element text they are read from.
static METADATA_RES: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        ("tax_id", r"<TAXON_ID>\s*([^<]*?)\s*</TAXON_ID>"),
        ("species", r"<SCIENTIFIC_NAME>\s*([^<]*?)\s*</SCIENTIFIC_NAME>"),
        (
            "study_id",
            r#"<EXTERNAL_ID\b[^>]*namespace="BioProject"[^>]*>\s*([^<]*?)\s*</EXTERNAL_ID>"#,
        ),
        (
            "sample_id",
            r#"<EXTERNAL_ID\b[^>]*namespace="BioSample"[^>]*>\s*([^<]*?)\s*</EXTERNAL_ID>"#,
        ),
        ("sample", r"(?s)<SAMPLE\b[^>]*>.*?<TITLE>\s*([^<]*?)\s*</TITLE>"),
        (
            "experiment_id",
            r"(?s)<EXPERIMENT\b[^>]*>.*?<PRIMARY_ID>\s*([^<]*?)\s*</PRIMARY_ID>",
        ),
    ]
    .into_iter()
    .map(|(key, pattern)| (key, Regex::new(pattern).expect("valid metadata pattern")))
    .collect()
});

/// NCBI eutils provider. Transfers deliver a normalized SRA archive that is
/// decoded and compressed locally.
#[derive(Debug, Clone)]
pub struct EntrezProvider {
    client: Client,
    base_url: String,
}

impl EntrezProvider {
    pub fn new() -> Result<Self, RepoError> {
        Ok(Self {
            client: metadata_client(ENTREZ_LABEL)?,
            base_url: EUTILS_BASE.to_string(),
        })
    }
}

impl Provider for EntrezProvider {
    fn label(&self) -> &str {
        ENTREZ_LABEL
    }

    fn payload(&self) -> PayloadKind {
        PayloadKind::ArchivePayload
    }

    fn resolve_metadata(&self, id: &AccessionId) -> Result<ValidationInfo, RepoError> {
        let url = format!("{}/efetch.fcgi", self.base_url);
        let body = fetch_text(ENTREZ_LABEL, id, || {
            self.client
                .get(&url)
                .query(&[("db", "sra"), ("id", id.as_str())])
        })?;
        parse_efetch(id, &body)
    }

    fn post_process(
        &self,
        path: &Path,
        unit: &mut DownloadUnit,
        toolkit: &dyn Toolkit,
    ) -> Result<(), RepoError> {
        info!(id = %unit.id, archive = %path.display(), "decoding archive");
        let decoded = toolkit.decode_archive(path)?;
        let compressed = decoded
            .iter()
            .map(|fastq| toolkit.compress(fastq))
            .collect::<Result<Vec<_>, _>>()?;

        info!(id = %unit.id, "recounting reads and bases");
        toolkit.recount(&compressed, unit.info.read_count, unit.info.base_count)?;
        unit.info
            .refresh_from_files(&compressed, |file| toolkit.md5sum(file))?;
        unit.paths = compressed;

        unlink_if_exists(path)?;
        info!(id = %unit.id, archive = %path.display(), "removed intermediate archive");
        Ok(())
    }
}

/// Builds validation info from an eutils `efetch` SRA experiment package.
pub fn parse_efetch(id: &AccessionId, xml: &str) -> Result<ValidationInfo, RepoError> {
    let not_found = |message: String| RepoError::RemoteNotFound {
        id: id.to_string(),
        source_label: ENTREZ_LABEL.to_string(),
        message,
    };

    let sra_files = SRA_FILE_RE
        .captures_iter(xml)
        .map(|caps| attributes(&caps[1]))
        .collect::<Vec<_>>();
    if sra_files.is_empty() {
        return Err(not_found(
            "accession is suppressed or does not exist".to_string(),
        ));
    }
    let url_attr = sra_files
        .iter()
        .find(|attrs| {
            attr(attrs, "cluster") == Some("public")
                && attr(attrs, "semantic_name") == Some("SRA Normalized")
        })
        .and_then(|attrs| attr(attrs, "url"))
        .ok_or_else(|| not_found("no public normalized archive".to_string()))?;

    let urls = url_attr
        .split(';')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
        .collect::<Vec<_>>();
    let files = urls
        .iter()
        .map(|url| url.rsplit('/').next().unwrap_or(url).to_string())
        .collect::<Vec<_>>();
    match files.first() {
        Some(first) if first == id.as_str() => {}
        Some(first) => return Err(not_found(format!("archive file is named {first}"))),
        None => return Err(not_found("archive entry has no url".to_string())),
    }

    let runs = RUN_RE
        .captures_iter(xml)
        .map(|caps| attributes(&caps[1]))
        .collect::<Vec<_>>();
    let [run] = runs.as_slice() else {
        return Err(not_found(format!(
            "expected a single run, found {}",
            runs.len()
        )));
    };
    if let Some(accession) = attr(run, "accession").filter(|acc| *acc != id.as_str()) {
        return Err(not_found(format!("run accession is {accession}")));
    }
    let count = |name: &str| -> Result<i64, RepoError> {
        attr(run, name)
            .and_then(|value| value.parse().ok())
            .ok_or_else(|| not_found(format!("run has no {name}")))
    };
    let read_count = count("total_spots")?;
    let base_count = count("total_bases")?;

    let metadata = METADATA_RES
        .iter()
        .filter_map(|(key, re)| {
            let value = re.captures(xml)?.get(1)?.as_str();
            (!value.is_empty()).then(|| (key.to_string(), unescape(value)))
        })
        .collect::<BTreeMap<_, _>>();

    Ok(ValidationInfo {
        id: id.to_string(),
        source: ENTREZ_LABEL.to_string(),
        urls,
        read_count,
        base_count,
        files,
        sizes: None,
        md5sums: None,
        metadata: Some(metadata),
    })
}

fn attributes(raw: &str) -> Vec<(String, String)> {
    ATTR_RE
        .captures_iter(raw)
        .map(|caps| (caps[1].to_string(), unescape(&caps[2])))
        .collect()
}

fn attr<'a>(attrs: &'a [(String, String)], name: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}

fn unescape(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
