use std::io::{self, Write};

use serde::Serialize;

use crate::info::ValidationInfo;
use crate::pipeline::FetchReport;
use crate::store::LinkReport;
use crate::validator::ValidationReport;

#[derive(Debug, Clone, Serialize)]
pub struct InfoResult {
    pub info: Vec<ValidationInfo>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListResult {
    pub total: usize,
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkResult {
    pub linked: usize,
    pub accessions: Vec<LinkEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkEntry {
    pub id: String,
    #[serde(flatten)]
    pub report: LinkReport,
}

/// Machine-readable command results on stdout.
pub struct JsonOutput;

impl JsonOutput {
    pub fn print_fetch(result: &FetchReport) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_validation(result: &ValidationReport) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_info(result: &InfoResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_list(result: &ListResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_link(result: &LinkResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}
