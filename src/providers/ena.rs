use std::path::Path;

use reqwest::blocking::Client;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::domain::AccessionId;
use crate::error::RepoError;
use crate::fs_util::{self, unlink_if_exists};
use crate::info::ValidationInfo;
use crate::pipeline::DownloadUnit;
use crate::providers::{PayloadKind, Provider, fetch_text, metadata_client};
use crate::toolkit::{Toolkit, paired_outputs};

pub const ENA_LABEL: &str = "EBI/ENA";
const ENA_PORTAL_BASE: &str = "https://www.ebi.ac.uk/ena/portal/api";
const FILEREPORT_FIELDS: &str =
    "fastq_ftp,submitted_ftp,read_count,base_count,fastq_md5,fastq_bytes";

#[derive(Debug, Default, Deserialize)]
struct FileReportRow {
    #[serde(default)]
    fastq_ftp: Option<String>,
    #[serde(default)]
    submitted_ftp: Option<String>,
    #[serde(default)]
    read_count: Option<String>,
    #[serde(default)]
    base_count: Option<String>,
    #[serde(default)]
    fastq_md5: Option<String>,
    #[serde(default)]
    fastq_bytes: Option<String>,
}

/// ENA portal provider. Transfers deliver final `.fastq.gz` files (or a
/// submitted CRAM that is converted locally).
#[derive(Debug, Clone)]
pub struct EnaProvider {
    client: Client,
    base_url: String,
}

impl EnaProvider {
    pub fn new() -> Result<Self, RepoError> {
        Ok(Self {
            client: metadata_client(ENA_LABEL)?,
            base_url: ENA_PORTAL_BASE.to_string(),
        })
    }

    fn verify_fastq(
        &self,
        path: &Path,
        name: &str,
        unit: &mut DownloadUnit,
        toolkit: &dyn Toolkit,
    ) -> Result<(), RepoError> {
        if !name.contains('_') {
            warn!(id = %unit.id, file = name, "discarding unpaired singleton reads");
            unit.paths.retain(|candidate| candidate != path);
            unit.info.remove_file(name)?;
            return unlink_if_exists(path);
        }
        let expected = unit.info.md5_of(name).ok_or_else(|| {
            RepoError::ValidationMismatch(format!("{name} has no published checksum"))
        })?;
        let actual = toolkit.md5sum(path)?;
        if actual != expected {
            return Err(RepoError::ValidationMismatch(format!(
                "{name} checksum {actual} does not match {expected}"
            )));
        }
        debug!(id = %unit.id, file = name, "checksum verified");
        Ok(())
    }

    fn convert_cram(
        &self,
        path: &Path,
        unit: &mut DownloadUnit,
        toolkit: &dyn Toolkit,
    ) -> Result<(), RepoError> {
        let outputs = paired_outputs(&path.with_extension(""), "fastq.gz");
        info!(id = %unit.id, cram = %path.display(), "converting cram to fastq");
        toolkit.convert_cram(path, &outputs)?;
        unit.info
            .refresh_from_files(&outputs, |output| toolkit.md5sum(output))?;
        unit.paths = outputs;
        unlink_if_exists(path)
    }
}

impl Provider for EnaProvider {
    fn label(&self) -> &str {
        ENA_LABEL
    }

    fn payload(&self) -> PayloadKind {
        PayloadKind::DirectPayload
    }

    fn resolve_metadata(&self, id: &AccessionId) -> Result<ValidationInfo, RepoError> {
        let url = format!("{}/filereport", self.base_url);
        let body = fetch_text(ENA_LABEL, id, || {
            self.client.get(&url).query(&[
                ("result", "read_run"),
                ("fields", FILEREPORT_FIELDS),
                ("format", "json"),
                ("accession", id.as_str()),
            ])
        })?;
        parse_filereport(id, &body)
    }

    fn post_process(
        &self,
        path: &Path,
        unit: &mut DownloadUnit,
        toolkit: &dyn Toolkit,
    ) -> Result<(), RepoError> {
        let name = fs_util::file_name_str(path)?.to_string();
        if name.ends_with(".fastq.gz") {
            self.verify_fastq(path, &name, unit, toolkit)
        } else if name.ends_with(".cram") {
            self.convert_cram(path, unit, toolkit)
        } else {
            Err(RepoError::ValidationMismatch(format!(
                "{name} is not a supported payload"
            )))
        }
    }
}

/// Builds validation info from an ENA `filereport` JSON body. An empty
/// result list means the run is suppressed or unknown.
pub fn parse_filereport(id: &AccessionId, body: &str) -> Result<ValidationInfo, RepoError> {
    let rows: Vec<FileReportRow> =
        serde_json::from_str(body.trim()).map_err(|err| RepoError::RemoteHttp {
            source_label: ENA_LABEL.to_string(),
            message: format!("invalid filereport response: {err}"),
        })?;
    let Some(row) = rows.into_iter().next() else {
        return Err(RepoError::RemoteNotFound {
            id: id.to_string(),
            source_label: ENA_LABEL.to_string(),
            message: "accession is suppressed or does not exist".to_string(),
        });
    };

    let urls = [&row.fastq_ftp, &row.submitted_ftp]
        .into_iter()
        .flatten()
        .map(|value| split_field(value))
        .find(|urls| !urls.is_empty())
        .unwrap_or_default()
        .into_iter()
        .map(|url| format!("ftp://{url}"))
        .collect::<Vec<_>>();
    let files = urls
        .iter()
        .map(|url| url.rsplit('/').next().unwrap_or(url).to_string())
        .collect::<Vec<_>>();

    let sizes = row.fastq_bytes.as_deref().map(split_field).map(|values| {
        aligned(&files, values, |value| value.parse::<u64>().ok())
    });
    let md5sums = row
        .fastq_md5
        .as_deref()
        .map(split_field)
        .map(|values| aligned(&files, values, |value| Some(value.to_lowercase())));

    Ok(ValidationInfo {
        id: id.to_string(),
        source: ENA_LABEL.to_string(),
        urls,
        read_count: parse_count(row.read_count.as_deref()),
        base_count: parse_count(row.base_count.as_deref()),
        files,
        sizes,
        md5sums,
        metadata: None,
    })
}

fn split_field(value: &str) -> Vec<String> {
    value
        .split(';')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

fn aligned<T, F>(files: &[String], values: Vec<String>, parse: F) -> Vec<Option<T>>
where
    T: Clone,
    F: Fn(&str) -> Option<T>,
{
    let mut parsed = values.iter().map(|value| parse(value)).collect::<Vec<_>>();
    parsed.resize(files.len(), None);
    parsed
}

fn parse_count(value: Option<&str>) -> i64 {
    value
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(-1)
}
