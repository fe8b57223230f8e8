// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Intel HEX file glue.
//!
//! The core programmer works on byte regions; this module turns HEX files
//! into such regions and back. Record parsing and emission are the `ihex`
//! crate's job; here we flatten data records into one contiguous image
//! (gaps filled with 0xFF, the erased state) and handle the page padding
//! and flash-window offsetting the programmer's alignment rules require.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use ihex::Record;

use updi::FlashInfo;

/// A contiguous byte image with its starting address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Image {
    pub start: u32,
    pub data: Vec<u8>,
}

impl Image {
    pub fn end(&self) -> u32 {
        self.start + self.data.len() as u32
    }
}

/// Loads a HEX file and flattens its data records into one image.
pub fn load(path: &Path) -> Result<Image> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("can't read {}", path.display()))?;

    // First pass: find the address range.
    let mut lo = u32::MAX;
    let mut hi = 0u32;
    let mut base = 0u32;
    for record in ihex::Reader::new(&text) {
        let record = record
            .with_context(|| format!("bad record in {}", path.display()))?;
        match record {
            Record::Data { offset, ref value } => {
                let addr = base + u32::from(offset);
                lo = lo.min(addr);
                hi = hi.max(addr + value.len() as u32);
            }
            Record::ExtendedLinearAddress(upper) => {
                base = u32::from(upper) << 16;
            }
            Record::ExtendedSegmentAddress(segment) => {
                base = u32::from(segment) << 4;
            }
            _ => {}
        }
    }
    if lo >= hi {
        bail!("{} contains no data records", path.display());
    }

    // Second pass: fill. Gaps keep the erased value.
    let mut data = vec![0xFF; (hi - lo) as usize];
    let mut base = 0u32;
    for record in ihex::Reader::new(&text) {
        match record? {
            Record::Data { offset, value } => {
                let at = (base + u32::from(offset) - lo) as usize;
                data[at..at + value.len()].copy_from_slice(&value);
            }
            Record::ExtendedLinearAddress(upper) => {
                base = u32::from(upper) << 16;
            }
            Record::ExtendedSegmentAddress(segment) => {
                base = u32::from(segment) << 4;
            }
            _ => {}
        }
    }

    Ok(Image { start: lo, data })
}

/// Fits an image to the programmer's rules: pad the edges out to page
/// boundaries with 0xFF, then move file-offset addresses up into the
/// mapped flash window. Fails if the result overruns the part.
pub fn adjust(image: Image, flash: &FlashInfo) -> Result<Image> {
    let mask = flash.page_size - 1;

    let lo = image.start & !mask;
    let hi = (image.end() + mask) & !mask;
    let mut data = vec![0xFF; (hi - lo) as usize];
    let at = (image.start - lo) as usize;
    data[at..at + image.data.len()].copy_from_slice(&image.data);

    // HEX files for these parts usually address from zero; map into the
    // flash window. Files that already use mapped addresses pass through.
    let start = if lo < flash.start { lo + flash.start } else { lo };

    let end = start + data.len() as u32;
    if end > flash.start + flash.size {
        bail!(
            "image {:#06x}..{:#06x} does not fit flash ({} bytes)",
            start,
            end,
            flash.size
        );
    }
    Ok(Image { start, data })
}

/// Writes an image out as Intel HEX, 16-byte data records.
pub fn save(path: &Path, image: &Image) -> Result<()> {
    let mut records = Vec::new();
    for (i, chunk) in image.data.chunks(16).enumerate() {
        records.push(Record::Data {
            offset: (image.start + i as u32 * 16) as u16,
            value: chunk.to_vec(),
        });
    }
    records.push(Record::EndOfFile);

    let text = ihex::create_object_file_representation(&records)
        .context("HEX emission failed")?;
    fs::write(path, text + "\n")
        .with_context(|| format!("can't write {}", path.display()))?;
    Ok(())
}
