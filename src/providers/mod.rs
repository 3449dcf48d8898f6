use std::path::Path;
use std::thread;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder};
use serde::Serialize;
use tracing::warn;

use crate::domain::{AccessionId, ProviderSite};
use crate::error::RepoError;
use crate::info::ValidationInfo;
use crate::pipeline::DownloadUnit;
use crate::toolkit::Toolkit;

pub mod ena;
pub mod entrez;

pub use ena::EnaProvider;
pub use entrez::EntrezProvider;

const METADATA_TIMEOUT: Duration = Duration::from_secs(60);
const THROTTLE_TRIES: usize = 5;
const THROTTLE_BACKOFF: Duration = Duration::from_secs(5);

/// What a provider's transfers deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PayloadKind {
    /// Final `.fastq.gz` files with published sizes and checksums.
    DirectPayload,
    /// An archive that has to be decoded locally; only read and base totals
    /// are published.
    ArchivePayload,
}

/// A remote archive that can describe an accession and turn its downloads
/// into storable read files.
pub trait Provider: Send + Sync {
    fn label(&self) -> &str;

    fn payload(&self) -> PayloadKind;

    fn resolve_metadata(&self, id: &AccessionId) -> Result<ValidationInfo, RepoError>;

    /// Runs once per finished download of `unit`. May rewrite the unit's
    /// paths and validation info.
    fn post_process(
        &self,
        path: &Path,
        unit: &mut DownloadUnit,
        toolkit: &dyn Toolkit,
    ) -> Result<(), RepoError>;
}

pub fn providers_for_site(site: ProviderSite) -> Result<Vec<Box<dyn Provider>>, RepoError> {
    let providers: Vec<Box<dyn Provider>> = match site {
        ProviderSite::Ena => vec![Box::new(EnaProvider::new()?)],
        ProviderSite::Entrez => vec![Box::new(EntrezProvider::new()?)],
        ProviderSite::EnaEntrez => vec![
            Box::new(EnaProvider::new()?),
            Box::new(EntrezProvider::new()?),
        ],
        ProviderSite::EntrezEna => vec![
            Box::new(EntrezProvider::new()?),
            Box::new(EnaProvider::new()?),
        ],
    };
    Ok(providers)
}

pub(crate) fn metadata_client(label: &str) -> Result<Client, RepoError> {
    Client::builder()
        .timeout(METADATA_TIMEOUT)
        .user_agent(format!("sra-repo/{}", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|err| RepoError::RemoteHttp {
            source_label: label.to_string(),
            message: err.to_string(),
        })
}

/// Sends a metadata request, backing off while the archive throttles with
/// HTTP 429. Returns the body of the first successful response.
pub(crate) fn fetch_text<F>(label: &str, id: &AccessionId, make_req: F) -> Result<String, RepoError>
where
    F: Fn() -> RequestBuilder,
{
    let mut tries = 0usize;
    loop {
        let response = make_req().send().map_err(|err| RepoError::RemoteHttp {
            source_label: label.to_string(),
            message: err.to_string(),
        })?;
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            tries += 1;
            if tries < THROTTLE_TRIES {
                warn!(id = %id, source = label, tries, "throttled by archive, backing off");
                thread::sleep(THROTTLE_BACKOFF);
                continue;
            }
        }
        let text = response.text().map_err(|err| RepoError::RemoteHttp {
            source_label: label.to_string(),
            message: err.to_string(),
        })?;
        if status.is_success() {
            return Ok(text);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(RepoError::RemoteNotFound {
                id: id.to_string(),
                source_label: label.to_string(),
                message: text.trim().to_string(),
            });
        }
        return Err(RepoError::RemoteError {
            id: id.to_string(),
            source_label: label.to_string(),
            status: status.as_u16(),
            message: text.trim().to_string(),
        });
    }
}
