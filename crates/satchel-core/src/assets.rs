//! Asset storage helpers.
//!
//! Assets are content-addressed: the key is derived from a hash of the
//! bytes, so re-saving identical data lands on the same key and assets are
//! effectively immutable once written.

use crate::context::StorageContext;
use crate::storage::{StorageError, StorageResult, ASSET_DIR};

/// Store an asset and return its key (`assets/<id>.<ext>`).
///
/// The id is the blake3 hash of the data unless `custom_id` overrides it.
/// The extension is taken from `file_name`, defaulting to `png`.
pub async fn save_asset<D>(
    ctx: &StorageContext<D>,
    data: Vec<u8>,
    custom_id: Option<&str>,
    file_name: Option<&str>,
) -> StorageResult<String> {
    if data.is_empty() {
        return Err(StorageError::EmptyPayload("asset".to_string()));
    }

    let id = match custom_id {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => blake3::hash(&data).to_hex().to_string(),
    };

    let extension = file_name
        .and_then(|name| name.rsplit_once('.').map(|(_, ext)| ext))
        .filter(|ext| !ext.is_empty())
        .unwrap_or("png");

    let key = format!("{ASSET_DIR}/{id}.{extension}");
    ctx.assets.set(&key, data).await?;
    Ok(key)
}

/// Load an asset by key, falling back to the legacy store for data written
/// before the asset migration.
pub async fn load_asset<D>(
    ctx: &StorageContext<D>,
    key: &str,
) -> StorageResult<Option<Vec<u8>>> {
    if let Some(data) = ctx.assets.get(key).await? {
        return Ok(Some(data));
    }
    if let Some(legacy) = &ctx.legacy {
        return legacy.get(key).await;
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CodecError, DocumentCodec, EncodeOptions};
    use crate::storage::{Backend, MemoryBackend};
    use std::sync::Arc;

    struct NullCodec;

    impl DocumentCodec<Vec<u8>> for NullCodec {
        fn encode(&self, doc: &Vec<u8>, _options: EncodeOptions) -> Result<Vec<u8>, CodecError> {
            Ok(doc.clone())
        }

        fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
            Ok(bytes.to_vec())
        }
    }

    fn make_ctx() -> StorageContext<Vec<u8>> {
        StorageContext::new(
            Arc::new(MemoryBackend::new()),
            Arc::new(MemoryBackend::new()),
            Arc::new(NullCodec),
        )
    }

    #[tokio::test]
    async fn test_save_asset_is_content_addressed() {
        let ctx = make_ctx();

        let key1 = save_asset(&ctx, vec![1, 2, 3], None, Some("pic.png"))
            .await
            .unwrap();
        let key2 = save_asset(&ctx, vec![1, 2, 3], None, Some("other.png"))
            .await
            .unwrap();

        assert_eq!(key1, key2, "identical bytes land on the same key");
        assert!(key1.starts_with("assets/"));
        assert!(key1.ends_with(".png"));
        assert_eq!(load_asset(&ctx, &key1).await.unwrap(), Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_save_asset_custom_id_and_extension() {
        let ctx = make_ctx();
        let key = save_asset(&ctx, vec![9], Some("avatar"), Some("voice.mp3"))
            .await
            .unwrap();
        assert_eq!(key, "assets/avatar.mp3");
    }

    #[tokio::test]
    async fn test_save_asset_rejects_empty() {
        let ctx = make_ctx();
        assert!(matches!(
            save_asset(&ctx, vec![], None, None).await,
            Err(StorageError::EmptyPayload(_))
        ));
    }

    #[tokio::test]
    async fn test_load_asset_falls_back_to_legacy() {
        let legacy = Arc::new(MemoryBackend::new());
        legacy.set("assets/old.png", vec![42]).await.unwrap();
        let ctx = make_ctx().with_legacy(legacy);

        assert_eq!(
            load_asset(&ctx, "assets/old.png").await.unwrap(),
            Some(vec![42])
        );
        assert_eq!(load_asset(&ctx, "assets/nope.png").await.unwrap(), None);
    }
}
