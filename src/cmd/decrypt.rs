use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};

use streamrelay::drm::{cenc, DrmDescriptor};

pub fn cmd_decrypt(init: &Path, segment: Option<&Path>, key: &str, output: Option<&Path>) -> Result<()> {
    let drm = DrmDescriptor::from_clearkey(key)?;
    let init_bytes = fs::read(init).with_context(|| format!("reading {}", init.display()))?;

    let clear = match segment {
        Some(segment) => {
            let segment_bytes = fs::read(segment).with_context(|| format!("reading {}", segment.display()))?;
            cenc::decrypt_segment(&init_bytes, &segment_bytes, &drm)?
        }
        None => cenc::decrypt_init(&init_bytes, &drm)?,
    };

    match output {
        Some(path) => {
            fs::write(path, &clear).with_context(|| format!("writing {}", path.display()))?;
            eprintln!("💾 Wrote {} clear bytes to {}", clear.len(), path.display());
        }
        None => std::io::stdout().write_all(&clear)?,
    }
    Ok(())
}
