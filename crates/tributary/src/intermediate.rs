//! Compressed intermediate-report storage between processing and merging.
//!
//! Each processed upload leaves one intermediate report in the KV store as
//! a hash of two zstd-compressed fields, `chunks` and `report_json`, under
//! a 24-hour TTL. The finisher reads and deletes them in batches. An entry
//! that expired during a long stall is substituted with an empty report so
//! the merge still completes.

use std::sync::Arc;

use anyhow::{Context, Result};
use tributary_kv::KeyValueStore;

use crate::report::{Report, ReportParts};

/// How long an intermediate report survives before the TTL reclaims it.
pub const REPORT_TTL: std::time::Duration = std::time::Duration::from_secs(24 * 60 * 60);

pub fn intermediate_report_key(upload_id: i64) -> String {
    format!("intermediate-report/{upload_id}")
}

/// An intermediate report paired with the upload that produced it.
#[derive(Debug, Clone)]
pub struct IntermediateReport {
    pub upload_id: i64,
    pub report: Report,
}

pub struct IntermediateStore {
    kv: Arc<dyn KeyValueStore>,
}

impl IntermediateStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    pub fn save(&self, upload_id: i64, report: &Report) -> Result<()> {
        let parts = report.to_parts().context("failed to serialise report")?;
        let zstd_chunks = zstd::encode_all(parts.chunks.as_slice(), 0)
            .context("failed to compress chunks")?;
        let zstd_report_json = zstd::encode_all(parts.report_json.as_slice(), 0)
            .context("failed to compress report json")?;

        // Size observability; compression ratios feed capacity planning.
        tracing::debug!(
            upload_id,
            chunks_bytes = parts.chunks.len(),
            chunks_zstd_bytes = zstd_chunks.len(),
            report_json_bytes = parts.report_json.len(),
            report_json_zstd_bytes = zstd_report_json.len(),
            "saving intermediate report"
        );

        let key = intermediate_report_key(upload_id);
        self.kv
            .hset_all(
                &key,
                &[
                    ("chunks".to_string(), zstd_chunks),
                    ("report_json".to_string(), zstd_report_json),
                ],
            )
            .context("failed to write intermediate report")?;
        self.kv
            .expire(&key, REPORT_TTL)
            .context("failed to set intermediate report TTL")?;
        Ok(())
    }

    /// Load the intermediate reports for a merge batch. Entries that
    /// expired come back as empty reports rather than failing the merge.
    pub fn load_many(&self, upload_ids: &[i64]) -> Result<Vec<IntermediateReport>> {
        let mut reports = Vec::with_capacity(upload_ids.len());
        for &upload_id in upload_ids {
            let fields = self
                .kv
                .hget_all(&intermediate_report_key(upload_id))
                .context("failed to read intermediate report")?;

            let (Some(chunks), Some(report_json)) =
                (fields.get("chunks"), fields.get("report_json"))
            else {
                tracing::warn!(upload_id, "intermediate report expired; substituting empty");
                reports.push(IntermediateReport {
                    upload_id,
                    report: Report::new(),
                });
                continue;
            };

            let parts = ReportParts {
                chunks: zstd::decode_all(chunks.as_slice())
                    .context("failed to decompress chunks")?,
                report_json: zstd::decode_all(report_json.as_slice())
                    .context("failed to decompress report json")?,
            };
            let report =
                Report::from_parts(&parts).context("failed to deserialise intermediate report")?;
            reports.push(IntermediateReport { upload_id, report });
        }
        Ok(reports)
    }

    pub fn delete_many(&self, upload_ids: &[i64]) -> Result<()> {
        for &upload_id in upload_ids {
            self.kv
                .del(&intermediate_report_key(upload_id))
                .context("failed to delete intermediate report")?;
        }
        Ok(())
    }
}
