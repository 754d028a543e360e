//! Portable single-file backup.
//!
//! The stream is a bare sequence of records, each
//! `[u32 LE name-length][name bytes][u32 LE data-length][data bytes]`,
//! with no header, footer or checksum. The record named
//! `database.risudat` is the document; every other record is an asset,
//! keyed by its basename. Record order is insignificant except that export
//! writes the document last.

use crate::client::DriveError;
use crate::names::PORTABLE_DOCUMENT_NAME;
use satchel_core::codec::EncodeOptions;
use satchel_core::context::StorageContext;
use satchel_core::document::Document;
use satchel_core::storage::{basename, ASSET_DIR, DATABASE_KEY};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Chunk size for incremental import reads.
pub const IMPORT_CHUNK_SIZE: usize = 1024 * 1024;

/// What an export wrote.
#[derive(Debug, Default)]
pub struct ExportReport {
    /// Asset records written.
    pub written: usize,
    /// Asset keys that could not be read and were skipped.
    pub missing: Vec<String>,
}

/// Outcome of an import.
#[derive(Debug)]
pub enum ImportOutcome {
    /// The stream carried a document record; it now sits under the
    /// canonical key and the application must fully restart rather than
    /// hot-swap in-memory state.
    RestartRequired { assets: usize },
    /// Assets only; no restart needed.
    Completed { assets: usize },
}

/// Append one length-prefixed record to `out`.
pub async fn write_record<W: AsyncWrite + Unpin>(
    out: &mut W,
    name: &str,
    data: &[u8],
) -> std::io::Result<()> {
    let name_bytes = basename(name).as_bytes();
    out.write_all(&(name_bytes.len() as u32).to_le_bytes())
        .await?;
    out.write_all(name_bytes).await?;
    out.write_all(&(data.len() as u32).to_le_bytes()).await?;
    out.write_all(data).await?;
    Ok(())
}

/// Export the document plus every stored asset as one backup stream.
///
/// Unreadable assets are skipped and reported, not fatal: a backup with a
/// few holes beats no backup. The document record goes last.
pub async fn export_backup<D: Document, W: AsyncWrite + Unpin>(
    ctx: &StorageContext<D>,
    doc: &D,
    out: &mut W,
) -> Result<ExportReport, DriveError> {
    ctx.sink.waiting("Saving local backup...");

    let keys: Vec<String> = ctx
        .assets
        .keys()
        .await?
        .into_iter()
        .filter(|k| k.starts_with(&format!("{ASSET_DIR}/")))
        .collect();

    let mut report = ExportReport::default();
    for (i, key) in keys.iter().enumerate() {
        let mut message = format!("Saving local backup... ({} / {})", i + 1, keys.len());
        if !report.missing.is_empty() {
            message.push_str(&format!("\n(skipping {})", report.missing.join(", ")));
        }
        ctx.sink.waiting(&message);

        match ctx.assets.get(key).await? {
            Some(data) if !data.is_empty() => {
                write_record(out, key, &data).await?;
                report.written += 1;
            }
            _ => report.missing.push(key.clone()),
        }
    }

    ctx.sink.waiting("Saving local backup... (saving database)");
    let data = ctx.codec.encode(doc, EncodeOptions { compression: true })?;
    write_record(out, PORTABLE_DOCUMENT_NAME, &data).await?;
    out.flush().await?;

    if report.missing.is_empty() {
        ctx.sink.done("Success");
    } else {
        let mut summary =
            String::from("Backup successful, but the following assets were missing and skipped:\n\n");
        for key in &report.missing {
            summary.push_str(&format!("* `{key}`\n"));
        }
        ctx.sink.markdown(&summary);
    }
    Ok(report)
}

/// Import a backup stream, reading incrementally in fixed-size chunks.
///
/// Each round parses as many complete records as the buffer holds and
/// keeps the unparsed tail for the next read; a record truncated at a
/// chunk boundary is simply not ready yet, not an error. The document
/// record is decode-validated and persisted raw under the canonical key —
/// in-memory state is never hot-swapped.
pub async fn import_backup<D: Document, R: AsyncRead + Unpin>(
    ctx: &StorageContext<D>,
    input: &mut R,
) -> Result<ImportOutcome, DriveError> {
    let mut buffer: Vec<u8> = Vec::new();
    let mut chunk = vec![0u8; IMPORT_CHUNK_SIZE];
    let mut assets = 0usize;
    let mut got_document = false;
    let mut bytes_read = 0usize;

    loop {
        let n = input.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        bytes_read += n;
        ctx.sink
            .waiting(&format!("Loading local backup... ({} KiB)", bytes_read / 1024));
        buffer.extend_from_slice(&chunk[..n]);

        let mut offset = 0;
        while let Some((name, data, consumed)) = parse_record(&buffer[offset..])? {
            if name == PORTABLE_DOCUMENT_NAME {
                log::info!("import: found document record, validating");
                ctx.codec.decode(&data)?;
                ctx.docs.set(DATABASE_KEY, data).await?;
                ctx.request_encoder_reload();
                got_document = true;
            } else if data.is_empty() {
                log::warn!("import: skipping empty asset record {name}");
            } else {
                let key = format!("{ASSET_DIR}/{}", basename(&name));
                ctx.assets.set(&key, data).await?;
                assets += 1;
            }
            offset += consumed;
        }
        buffer.drain(..offset);
    }

    if !buffer.is_empty() {
        log::warn!(
            "import: {} trailing bytes did not form a complete record",
            buffer.len()
        );
    }

    if got_document {
        Ok(ImportOutcome::RestartRequired { assets })
    } else {
        ctx.sink.done("Success");
        Ok(ImportOutcome::Completed { assets })
    }
}

/// Parse one record off the front of `buf`, if fully present.
///
/// Returns `(name, data, bytes consumed)`, or `None` when the buffer ends
/// mid-record.
fn parse_record(buf: &[u8]) -> Result<Option<(String, Vec<u8>, usize)>, DriveError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let name_len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if buf.len() < 4 + name_len + 4 {
        return Ok(None);
    }
    let name = std::str::from_utf8(&buf[4..4 + name_len])
        .map_err(|e| DriveError::Malformed(format!("record name is not UTF-8: {e}")))?
        .to_string();

    let len_at = 4 + name_len;
    let data_len = u32::from_le_bytes([
        buf[len_at],
        buf[len_at + 1],
        buf[len_at + 2],
        buf[len_at + 3],
    ]) as usize;
    let total = 4 + name_len + 4 + data_len;
    if buf.len() < total {
        return Ok(None);
    }
    let data = buf[len_at + 4..total].to_vec();
    Ok(Some((name, data, total)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use satchel_core::codec::{CodecError, DocumentCodec};
    use satchel_core::storage::{Backend, MemoryBackend};
    use serde::{Deserialize, Serialize};
    use std::pin::Pin;
    use std::sync::Arc;
    use std::task::{Context, Poll};

    #[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
    struct NoteDoc {
        text: String,
        assets: Vec<String>,
        first_run_done: bool,
    }

    impl Document for NoteDoc {
        fn asset_refs(&self) -> Vec<String> {
            self.assets.clone()
        }

        fn complete_first_run(&mut self) {
            self.first_run_done = true;
        }
    }

    struct JsonCodec;

    impl DocumentCodec<NoteDoc> for JsonCodec {
        fn encode(&self, doc: &NoteDoc, _options: EncodeOptions) -> Result<Vec<u8>, CodecError> {
            serde_json::to_vec(doc).map_err(|e| CodecError::Encode(e.to_string()))
        }

        fn decode(&self, bytes: &[u8]) -> Result<NoteDoc, CodecError> {
            serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
        }
    }

    /// Reader that yields at most `step` bytes per read, to force record
    /// boundaries to split across chunks.
    struct TrickleReader {
        data: Vec<u8>,
        pos: usize,
        step: usize,
    }

    impl TrickleReader {
        fn new(data: Vec<u8>, step: usize) -> Self {
            Self { data, pos: 0, step }
        }
    }

    impl AsyncRead for TrickleReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            let remaining = self.data.len() - self.pos;
            let n = remaining.min(self.step).min(buf.remaining());
            let start = self.pos;
            buf.put_slice(&self.data[start..start + n]);
            self.pos += n;
            Poll::Ready(Ok(()))
        }
    }

    fn make_ctx() -> StorageContext<NoteDoc> {
        StorageContext::new(
            Arc::new(MemoryBackend::new()),
            Arc::new(MemoryBackend::new()),
            Arc::new(JsonCodec),
        )
    }

    #[tokio::test]
    async fn test_export_import_roundtrip() {
        let source = make_ctx();
        let doc = NoteDoc {
            text: "the document".into(),
            assets: vec!["assets/abc.png".into()],
            first_run_done: true,
        };
        source
            .assets
            .set("assets/abc.png", vec![0, 1, 2, 3, 4, 5, 6, 7, 8, 9])
            .await
            .unwrap();

        let mut stream = Vec::new();
        let report = export_backup(&source, &doc, &mut stream).await.unwrap();
        assert_eq!(report.written, 1);
        assert!(report.missing.is_empty());

        // Import into a fresh empty store.
        let target = make_ctx();
        let outcome = import_backup(&target, &mut stream.as_slice())
            .await
            .unwrap();

        let ImportOutcome::RestartRequired { assets } = outcome else {
            panic!("expected restart outcome");
        };
        assert_eq!(assets, 1);
        assert_eq!(
            target.assets.get("assets/abc.png").await.unwrap(),
            Some(vec![0, 1, 2, 3, 4, 5, 6, 7, 8, 9])
        );
        let stored = target.docs.get(DATABASE_KEY).await.unwrap().unwrap();
        let decoded: NoteDoc = serde_json::from_slice(&stored).unwrap();
        assert_eq!(decoded, doc);
    }

    #[tokio::test]
    async fn test_import_handles_records_split_across_chunks() {
        let source = make_ctx();
        let doc = NoteDoc {
            text: "split me".into(),
            ..NoteDoc::default()
        };
        source
            .assets
            .set("assets/a.png", vec![1; 37])
            .await
            .unwrap();
        source
            .assets
            .set("assets/b.png", vec![2; 53])
            .await
            .unwrap();

        let mut stream = Vec::new();
        export_backup(&source, &doc, &mut stream).await.unwrap();

        // Three bytes per read: every length prefix gets split.
        let target = make_ctx();
        let mut reader = TrickleReader::new(stream, 3);
        let outcome = import_backup(&target, &mut reader).await.unwrap();

        assert!(matches!(
            outcome,
            ImportOutcome::RestartRequired { assets: 2 }
        ));
        assert_eq!(
            target.assets.get("assets/a.png").await.unwrap(),
            Some(vec![1; 37])
        );
        assert_eq!(
            target.assets.get("assets/b.png").await.unwrap(),
            Some(vec![2; 53])
        );
    }

    #[tokio::test]
    async fn test_export_skips_missing_assets_and_reports_them() {
        struct HalfBrokenBackend {
            inner: MemoryBackend,
        }

        impl satchel_core::storage::Backend for HalfBrokenBackend {
            fn get(
                &self,
                key: &str,
            ) -> satchel_core::storage::BoxFuture<
                '_,
                satchel_core::storage::StorageResult<Option<Vec<u8>>>,
            > {
                if key == "assets/gone.png" {
                    return Box::pin(async { Ok(None) });
                }
                self.inner.get(key)
            }

            fn set(
                &self,
                key: &str,
                data: Vec<u8>,
            ) -> satchel_core::storage::BoxFuture<'_, satchel_core::storage::StorageResult<()>>
            {
                self.inner.set(key, data)
            }

            fn delete(
                &self,
                key: &str,
            ) -> satchel_core::storage::BoxFuture<'_, satchel_core::storage::StorageResult<()>>
            {
                self.inner.delete(key)
            }

            fn list(
                &self,
                dir: &str,
            ) -> satchel_core::storage::BoxFuture<
                '_,
                satchel_core::storage::StorageResult<Vec<String>>,
            > {
                self.inner.list(dir)
            }

            fn keys(
                &self,
            ) -> satchel_core::storage::BoxFuture<
                '_,
                satchel_core::storage::StorageResult<Vec<String>>,
            > {
                self.inner.keys()
            }
        }

        let inner = MemoryBackend::new();
        inner.set("assets/ok.png", vec![1]).await.unwrap();
        inner.set("assets/gone.png", vec![2]).await.unwrap();
        let ctx = StorageContext::new(
            Arc::new(MemoryBackend::new()),
            Arc::new(HalfBrokenBackend { inner }),
            Arc::new(JsonCodec),
        );

        let mut stream = Vec::new();
        let report = export_backup(&ctx, &NoteDoc::default(), &mut stream)
            .await
            .unwrap();

        assert_eq!(report.written, 1);
        assert_eq!(report.missing, vec!["assets/gone.png"]);

        // The stream is still importable.
        let target = make_ctx();
        let outcome = import_backup(&target, &mut stream.as_slice())
            .await
            .unwrap();
        assert!(matches!(outcome, ImportOutcome::RestartRequired { assets: 1 }));
    }

    #[tokio::test]
    async fn test_import_corrupt_document_aborts() {
        let mut stream = Vec::new();
        write_record(&mut stream, "assets/fine.png", &[1, 2])
            .await
            .unwrap();
        write_record(&mut stream, PORTABLE_DOCUMENT_NAME, b"not json")
            .await
            .unwrap();

        let target = make_ctx();
        let result = import_backup(&target, &mut stream.as_slice()).await;

        assert!(result.is_err());
        // Nothing landed under the canonical key.
        assert_eq!(target.docs.get(DATABASE_KEY).await.unwrap(), None);
        // The asset written before the bad record remains, matching the
        // incremental nature of the import.
        assert!(target.assets.get("assets/fine.png").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_import_assets_only_stream() {
        let mut stream = Vec::new();
        write_record(&mut stream, "loose.png", &[7, 7]).await.unwrap();

        let target = make_ctx();
        let outcome = import_backup(&target, &mut stream.as_slice())
            .await
            .unwrap();

        assert!(matches!(outcome, ImportOutcome::Completed { assets: 1 }));
        assert_eq!(
            target.assets.get("assets/loose.png").await.unwrap(),
            Some(vec![7, 7])
        );
    }

    #[test]
    fn test_parse_record_needs_full_prefix() {
        assert!(parse_record(&[1, 0]).unwrap().is_none());
        assert!(parse_record(&[1, 0, 0, 0]).unwrap().is_none());
        assert!(parse_record(&[1, 0, 0, 0, b'a', 2, 0]).unwrap().is_none());
        assert!(parse_record(&[1, 0, 0, 0, b'a', 2, 0, 0, 0, 9])
            .unwrap()
            .is_none());

        let full = [1, 0, 0, 0, b'a', 2, 0, 0, 0, 9, 8];
        let (name, data, consumed) = parse_record(&full).unwrap().unwrap();
        assert_eq!(name, "a");
        assert_eq!(data, vec![9, 8]);
        assert_eq!(consumed, full.len());
    }
}
