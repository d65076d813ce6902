//! Volume configuration.

use crate::policy::FormattingPolicy;
use serde::{Deserialize, Serialize};
use tfs_error::{Result, TfsError};
use tfs_types::{BlockSize, DEFAULT_BLOCK_SIZE};

/// Options for [`crate::Volume::mount`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeOptions {
    /// Page/block size in bytes. Must match the store and the device.
    pub block_size: u32,
    /// Pages moved per tail→extent batch.
    pub tail_to_extent_batch_pages: u64,
    /// Items removed per truncate cut step.
    pub cut_batch_items: usize,
    /// Run the extent→tail policy when the last handle closes.
    pub convert_on_close: bool,
    pub formatting: FormattingPolicy,
}

impl Default for VolumeOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            tail_to_extent_batch_pages: 3,
            cut_batch_items: 64,
            convert_on_close: true,
            formatting: FormattingPolicy::default(),
        }
    }
}

impl VolumeOptions {
    pub fn validate(&self) -> Result<()> {
        BlockSize::new(self.block_size)
            .map_err(|e| TfsError::Format(format!("volume block_size: {e}")))?;
        if self.tail_to_extent_batch_pages == 0 {
            return Err(TfsError::Format(
                "tail_to_extent_batch_pages must be > 0".to_owned(),
            ));
        }
        if self.cut_batch_items == 0 {
            return Err(TfsError::Format("cut_batch_items must be > 0".to_owned()));
        }
        Ok(())
    }

    pub(crate) fn block_size(&self) -> Result<BlockSize> {
        BlockSize::new(self.block_size)
            .map_err(|e| TfsError::Format(format!("volume block_size: {e}")))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let options: Self = serde_json::from_str(json)
            .map_err(|e| TfsError::Format(format!("volume options: {e}")))?;
        options.validate()?;
        Ok(options)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| TfsError::Format(format!("volume options: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let options = VolumeOptions::default();
        options.validate().expect("defaults validate");
        assert_eq!(options.block_size, 4096);
        assert_eq!(options.tail_to_extent_batch_pages, 3);
        assert!(options.convert_on_close);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let options = VolumeOptions::from_json(
            r#"{"block_size": 512, "formatting": {"kind": "small_file", "max_tail_bytes": 2048}}"#,
        )
        .expect("parse");
        assert_eq!(options.block_size, 512);
        assert_eq!(options.cut_batch_items, 64);
        assert!(matches!(
            options.formatting,
            FormattingPolicy::SmallFile { max_tail_bytes: 2048 }
        ));
        let back = VolumeOptions::from_json(&options.to_json().expect("encode")).expect("reparse");
        assert_eq!(back.block_size, 512);
    }

    #[test]
    fn bad_geometry_is_rejected() {
        assert!(VolumeOptions::from_json(r#"{"block_size": 1000}"#).is_err());
        assert!(VolumeOptions::from_json(r#"{"tail_to_extent_batch_pages": 0}"#).is_err());
        assert!(VolumeOptions::from_json(r#"{"cut_batch_items": 0}"#).is_err());
        assert!(VolumeOptions::from_json("not json").is_err());
    }
}
