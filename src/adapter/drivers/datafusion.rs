//! Embedded DataFusion warehouse
//!
//! Runs experiment queries in-process over Parquet tables, reached through
//! `object_store`. Useful for small deployments and for tests that need a
//! real SQL engine.

use crate::adapter::{RawRow, SqlExecutor};
use crate::{Error, Result};
use arrow::json::ArrayWriter;
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use datafusion::datasource::file_format::parquet::ParquetFormat;
use datafusion::datasource::listing::{
    ListingOptions, ListingTable, ListingTableConfig, ListingTableUrl,
};
use datafusion::prelude::*;
use object_store::ObjectStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument};

/// A Parquet table exposed to experiment SQL
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSource {
    pub name: String,
    /// `file:///path/`, `s3://bucket/prefix/` or a local path
    pub location: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataFusionParams {
    #[serde(default)]
    pub tables: Vec<TableSource>,
}

pub struct DataFusionExecutor {
    ctx: SessionContext,
    params: DataFusionParams,
    object_store: Option<Arc<dyn ObjectStore>>,
    registered: OnceCell<()>,
}

impl DataFusionExecutor {
    pub fn new(params: DataFusionParams) -> Self {
        let config = SessionConfig::new()
            .with_batch_size(8192)
            .with_information_schema(true);
        Self {
            ctx: SessionContext::new_with_config(config),
            params,
            object_store: None,
            registered: OnceCell::new(),
        }
    }

    /// Serve tables whose locations live in `store` (e.g. an S3 bucket).
    pub fn with_object_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.object_store = Some(store);
        self
    }

    /// Wrap a context whose tables are already registered.
    pub fn from_context(ctx: SessionContext) -> Self {
        Self {
            ctx,
            params: DataFusionParams::default(),
            object_store: None,
            registered: OnceCell::new(),
        }
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    async fn ensure_registered(&self) -> Result<()> {
        self.registered
            .get_or_try_init(|| async {
                for table in &self.params.tables {
                    self.register_table(table).await?;
                }
                Ok::<(), Error>(())
            })
            .await?;
        Ok(())
    }

    async fn register_table(&self, table: &TableSource) -> Result<()> {
        let table_url = ListingTableUrl::parse(&table.location)?;
        if let Some(store) = &self.object_store {
            self.ctx
                .register_object_store(table_url.object_store().as_ref(), store.clone());
        }

        let listing_options = ListingOptions::new(Arc::new(ParquetFormat::default()))
            .with_file_extension(".parquet");
        let config = ListingTableConfig::new(table_url)
            .with_listing_options(listing_options)
            .infer_schema(&self.ctx.state())
            .await?;
        let listing = ListingTable::try_new(config)?;
        self.ctx.register_table(table.name.as_str(), Arc::new(listing))?;

        info!(table = %table.name, location = %table.location, "Registered warehouse table");
        Ok(())
    }
}

/// Arrow batches to JSON rows, one object per row.
pub(crate) fn batches_to_rows(batches: &[RecordBatch]) -> Result<Vec<RawRow>> {
    if batches.iter().all(|b| b.num_rows() == 0) {
        return Ok(Vec::new());
    }
    let mut writer = ArrayWriter::new(Vec::new());
    let refs: Vec<&RecordBatch> = batches.iter().collect();
    writer.write_batches(&refs)?;
    writer.finish()?;
    let buf = writer.into_inner();
    let rows: Vec<RawRow> = serde_json::from_slice(&buf)?;
    Ok(rows
        .into_iter()
        .map(|row| {
            row.into_iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v))
                .collect()
        })
        .collect())
}

#[async_trait]
impl SqlExecutor for DataFusionExecutor {
    #[instrument(skip_all, err)]
    async fn execute(&self, sql: &str) -> Result<Vec<RawRow>> {
        self.ensure_registered().await?;
        let df = self.ctx.sql(sql).await?;
        let batches = df.collect().await?;
        let rows = batches_to_rows(&batches)?;
        debug!(rows = rows.len(), "DataFusion query returned");
        Ok(rows)
    }
}
