//! ext2/3/4 filesystem parser
//!
//! Walks the superblock, group descriptor table and inode tables to
//! find deleted-but-not-overwritten inodes. The inode table location
//! always comes from the group descriptors; approximating it from the
//! superblock is not reliable and is not done here.

use crate::binary::{looks_textual, sniff_file_type};
use crate::domain::entities::{Fragment, RecoveredFile};
use crate::domain::services::{FileSystemType, FilesystemParser};
use byteorder::{LittleEndian, ReadBytesExt};
use log::{debug, info};
use std::io::Cursor;

const SUPERBLOCK_OFFSET: usize = 1024;
/// Fields we read reach to s_volume_name at offset 120 + 16.
const SUPERBLOCK_MIN_LEN: usize = 264;
const EXT_MAGIC: u16 = 0xEF53;

const FEATURE_COMPAT_HAS_JOURNAL: u32 = 0x0004;
const FEATURE_INCOMPAT_EXTENTS: u32 = 0x0040;
const FEATURE_INCOMPAT_64BIT: u32 = 0x0080;
const FEATURE_RO_COMPAT_LARGE_FILE: u32 = 0x0002;

/// Inode flag: the block map is an extent tree.
const EXT4_EXTENTS_FL: u32 = 0x0008_0000;
const EXTENT_HEADER_MAGIC: u16 = 0xF30A;

/// Regular-file mode bits.
const S_IFMT: u16 = 0xF000;
const S_IFREG: u16 = 0x8000;

/// Harvest bounds.
const MAX_GROUPS: u32 = 200;
const MAX_INODES_PER_GROUP: u32 = 2000;
const MAX_FILE_SIZE: u64 = 1 << 30;
const DIRECT_POINTERS: usize = 12;
const SNIFF_LEN: usize = 512;

/// Fields of the on-disk superblock this parser needs.
#[derive(Debug)]
struct Superblock {
    inodes_count: u32,
    blocks_count: u32,
    free_inodes_count: u32,
    log_block_size: u32,
    blocks_per_group: u32,
    inodes_per_group: u32,
    magic: u16,
    inode_size: u16,
    feature_compat: u32,
    feature_incompat: u32,
    feature_ro_compat: u32,
    volume_name: String,
}

impl Superblock {
    fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < SUPERBLOCK_OFFSET + SUPERBLOCK_MIN_LEN {
            return None;
        }
        let sb = &data[SUPERBLOCK_OFFSET..];
        let mut cursor = Cursor::new(sb);

        let inodes_count = cursor.read_u32::<LittleEndian>().ok()?;
        let blocks_count = cursor.read_u32::<LittleEndian>().ok()?;

        cursor.set_position(16);
        let free_inodes_count = cursor.read_u32::<LittleEndian>().ok()?;

        cursor.set_position(24);
        let log_block_size = cursor.read_u32::<LittleEndian>().ok()?;

        cursor.set_position(32);
        let blocks_per_group = cursor.read_u32::<LittleEndian>().ok()?;

        cursor.set_position(40);
        let inodes_per_group = cursor.read_u32::<LittleEndian>().ok()?;

        cursor.set_position(56);
        let magic = cursor.read_u16::<LittleEndian>().ok()?;

        cursor.set_position(88);
        let inode_size = cursor.read_u16::<LittleEndian>().ok()?;

        cursor.set_position(92);
        let feature_compat = cursor.read_u32::<LittleEndian>().ok()?;
        let feature_incompat = cursor.read_u32::<LittleEndian>().ok()?;
        let feature_ro_compat = cursor.read_u32::<LittleEndian>().ok()?;

        let volume_name = sb[120..136]
            .iter()
            .take_while(|&&b| b != 0)
            .map(|&b| b as char)
            .collect();

        Some(Self {
            inodes_count,
            blocks_count,
            free_inodes_count,
            log_block_size,
            blocks_per_group,
            inodes_per_group,
            magic,
            inode_size,
            feature_compat,
            feature_incompat,
            feature_ro_compat,
            volume_name,
        })
    }

    fn is_valid(&self) -> bool {
        self.magic == EXT_MAGIC
            && self.inodes_count > 0
            && self.blocks_count > 0
            && self.inodes_per_group > 0
            && self.blocks_per_group > 0
            && (1024..=65536).contains(&self.block_size())
    }

    fn block_size(&self) -> u64 {
        1024u64 << self.log_block_size.min(16)
    }

    fn inode_size(&self) -> u64 {
        if self.inode_size > 0 {
            self.inode_size as u64
        } else {
            128
        }
    }

    fn group_count(&self) -> u32 {
        self.blocks_count.div_ceil(self.blocks_per_group)
    }

    fn has_64bit_descriptors(&self) -> bool {
        self.feature_incompat & FEATURE_INCOMPAT_64BIT != 0
    }

    fn descriptor_size(&self) -> u64 {
        if self.has_64bit_descriptors() {
            64
        } else {
            32
        }
    }

    /// The group descriptor table starts one block after the
    /// superblock: block 2 for 1 KiB blocks, block 1 otherwise.
    fn descriptor_table_offset(&self) -> u64 {
        if self.block_size() < 2048 {
            2 * self.block_size()
        } else {
            self.block_size()
        }
    }

    fn version(&self) -> FileSystemType {
        if self.feature_incompat & FEATURE_INCOMPAT_EXTENTS != 0 {
            FileSystemType::Ext4
        } else if self.feature_compat & FEATURE_COMPAT_HAS_JOURNAL != 0 {
            FileSystemType::Ext3
        } else {
            FileSystemType::Ext2
        }
    }
}

/// Fields of an on-disk inode this parser needs.
struct Inode {
    mode: u16,
    size_lo: u32,
    dtime: u32,
    links_count: u16,
    blocks_lo: u32,
    flags: u32,
    block: [u32; 15],
    size_high: u32,
}

impl Inode {
    fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 128 {
            return None;
        }
        let mut cursor = Cursor::new(data);

        let mode = cursor.read_u16::<LittleEndian>().ok()?;

        cursor.set_position(4);
        let size_lo = cursor.read_u32::<LittleEndian>().ok()?;

        cursor.set_position(20);
        let dtime = cursor.read_u32::<LittleEndian>().ok()?;

        cursor.set_position(26);
        let links_count = cursor.read_u16::<LittleEndian>().ok()?;
        let blocks_lo = cursor.read_u32::<LittleEndian>().ok()?;
        let flags = cursor.read_u32::<LittleEndian>().ok()?;

        cursor.set_position(40);
        let mut block = [0u32; 15];
        for slot in &mut block {
            *slot = cursor.read_u32::<LittleEndian>().ok()?;
        }

        cursor.set_position(108);
        let size_high = cursor.read_u32::<LittleEndian>().ok()?;

        Some(Self {
            mode,
            size_lo,
            dtime,
            links_count,
            blocks_lo,
            flags,
            block,
            size_high,
        })
    }

    /// A recoverable deletion candidate: deletion time stamped, link
    /// count zero, plausible size, data blocks once allocated, and a
    /// regular file.
    fn is_deleted_candidate(&self) -> bool {
        self.dtime != 0
            && self.links_count == 0
            && self.size_lo > 0
            && (self.size_lo as u64) < MAX_FILE_SIZE
            && self.blocks_lo > 0
            && self.mode & S_IFMT == S_IFREG
    }

    fn file_size(&self, sb: &Superblock) -> u64 {
        let mut size = self.size_lo as u64;
        if sb.feature_ro_compat & FEATURE_RO_COMPAT_LARGE_FILE != 0 {
            size |= (self.size_high as u64) << 32;
        }
        size
    }

    fn uses_extents(&self) -> bool {
        self.flags & EXT4_EXTENTS_FL != 0
    }
}

pub struct ExtParser;

impl ExtParser {
    pub fn new() -> Self {
        Self
    }

    /// Inode-table byte offset for `group`, read from its descriptor.
    fn inode_table_offset(&self, data: &[u8], sb: &Superblock, group: u32) -> Option<u64> {
        let desc_offset = sb.descriptor_table_offset() + group as u64 * sb.descriptor_size();
        let desc_end = desc_offset + sb.descriptor_size();
        if desc_end > data.len() as u64 {
            return None;
        }

        let desc = &data[desc_offset as usize..desc_end as usize];
        let table_lo = read_u32_le(desc, 8)?;
        let table_block = if sb.has_64bit_descriptors() {
            let table_hi = read_u32_le(desc, 40)?;
            (table_hi as u64) << 32 | table_lo as u64
        } else {
            table_lo as u64
        };

        Some(table_block * sb.block_size())
    }

    /// Data fragments for a deleted inode, clipped so their sizes sum
    /// to the returned file size.
    fn locate_data(&self, inode: &Inode, sb: &Superblock, window_len: u64) -> Vec<Fragment> {
        let block_size = sb.block_size();
        let mut remaining = inode.file_size(sb);
        let mut fragments = Vec::new();

        if inode.uses_extents() && sb.feature_incompat & FEATURE_INCOMPAT_EXTENTS != 0 {
            // Best-effort: only the first extent of a depth-0 tree.
            if let Some(fragment) = first_extent_fragment(inode, block_size, remaining) {
                if fragment.end() <= window_len {
                    return vec![fragment];
                }
            }
            return fragments;
        }

        for &pointer in inode.block.iter().take(DIRECT_POINTERS) {
            if remaining == 0 {
                break;
            }
            if pointer == 0 {
                continue;
            }

            let offset = pointer as u64 * block_size;
            let size = remaining.min(block_size);
            if offset + size > window_len {
                continue;
            }

            // Indirect blocks are not followed; coverage stops at the
            // direct pointers. Adjacent blocks collapse into one
            // fragment.
            if let Some(last) = fragments.last_mut() {
                if last.end() == offset {
                    last.size += size;
                    remaining -= size;
                    continue;
                }
            }
            fragments.push(Fragment::new(offset, size));
            remaining -= size;
        }

        fragments
    }
}

impl Default for ExtParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FilesystemParser for ExtParser {
    fn can_parse(&self, data: &[u8]) -> bool {
        Superblock::parse(data).is_some_and(|sb| sb.is_valid())
    }

    fn fs_type(&self) -> FileSystemType {
        FileSystemType::Ext4
    }

    fn recover_deleted(&self, data: &[u8]) -> Vec<RecoveredFile> {
        let Some(sb) = Superblock::parse(data).filter(|sb| sb.is_valid()) else {
            debug!("ext superblock invalid, nothing to recover");
            return Vec::new();
        };

        info!(
            "scanning {} for deleted inodes ({} groups, block size {})",
            sb.version().name(),
            sb.group_count(),
            sb.block_size()
        );

        let inode_size = sb.inode_size();
        let mut recovered = Vec::new();

        for group in 0..sb.group_count().min(MAX_GROUPS) {
            let Some(table_offset) = self.inode_table_offset(data, &sb, group) else {
                continue;
            };
            if table_offset >= data.len() as u64 {
                continue;
            }

            let remaining_inodes = sb
                .inodes_count
                .saturating_sub(group.saturating_mul(sb.inodes_per_group));
            let inodes_in_group = sb
                .inodes_per_group
                .min(remaining_inodes)
                .min(MAX_INODES_PER_GROUP);

            for index in 0..inodes_in_group {
                let inode_offset = table_offset + index as u64 * inode_size;
                let inode_end = inode_offset + 128;
                if inode_end > data.len() as u64 {
                    break;
                }

                let Some(inode) = Inode::parse(&data[inode_offset as usize..inode_end as usize])
                else {
                    continue;
                };
                if !inode.is_deleted_candidate() {
                    continue;
                }

                let fragments = self.locate_data(&inode, &sb, data.len() as u64);
                if fragments.is_empty() {
                    continue;
                }

                let inode_number = group as u64 * sb.inodes_per_group as u64 + index as u64 + 1;
                let file_type = classify_content(data, &fragments[0]);
                let filename = format!("deleted_inode_{inode_number}.{file_type}");

                debug!(
                    "deleted inode {} ({} bytes, type {})",
                    inode_number,
                    fragments.iter().map(|f| f.size).sum::<u64>(),
                    file_type
                );

                recovered.push(RecoveredFile::fragmented(
                    filename, &file_type, fragments, 0.70,
                ));
            }
        }

        info!("ext metadata pass found {} candidates", recovered.len());
        recovered
    }

    fn info(&self, data: &[u8]) -> String {
        match Superblock::parse(data).filter(|sb| sb.is_valid()) {
            Some(sb) => format!(
                "{} filesystem\nblock size: {} bytes\nblocks: {}\ninodes: {} ({} free)\nlabel: {}",
                sb.version().name(),
                sb.block_size(),
                sb.blocks_count,
                sb.inodes_count,
                sb.free_inodes_count,
                if sb.volume_name.is_empty() {
                    "<none>"
                } else {
                    sb.volume_name.as_str()
                },
            ),
            None => "ext filesystem (unrecognized superblock)".to_string(),
        }
    }
}

/// First extent of a depth-0 extent tree stored in `i_block`.
fn first_extent_fragment(inode: &Inode, block_size: u64, file_size: u64) -> Option<Fragment> {
    let mut raw = [0u8; 60];
    for (i, word) in inode.block.iter().enumerate() {
        raw[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
    }

    let magic = u16::from_le_bytes([raw[0], raw[1]]);
    let entries = u16::from_le_bytes([raw[2], raw[3]]);
    let depth = u16::from_le_bytes([raw[6], raw[7]]);
    if magic != EXTENT_HEADER_MAGIC || entries == 0 || depth != 0 {
        return None;
    }

    // struct ext4_extent at offset 12: logical block, length,
    // physical block split hi/lo.
    let length = u16::from_le_bytes([raw[16], raw[17]]) as u64;
    let start_hi = u16::from_le_bytes([raw[18], raw[19]]) as u64;
    let start_lo = u32::from_le_bytes([raw[20], raw[21], raw[22], raw[23]]) as u64;
    let physical = (start_hi << 32) | start_lo;
    if physical == 0 || length == 0 {
        return None;
    }

    let covered = (length * block_size).min(file_size);
    if covered == 0 {
        return None;
    }
    Some(Fragment::new(physical * block_size, covered))
}

/// Content-sniffs the first fragment: magic table, then the printable
/// heuristic, else opaque data.
fn classify_content(data: &[u8], fragment: &Fragment) -> String {
    let start = fragment.offset as usize;
    let end = (start + SNIFF_LEN).min(data.len()).min(fragment.end() as usize);
    if start >= end {
        return "dat".to_string();
    }

    let head = &data[start..end];
    if let Some(tag) = sniff_file_type(head) {
        return tag.to_string();
    }
    if looks_textual(head) {
        return "txt".to_string();
    }
    "dat".to_string()
}

/// Reads a little-endian u32 at a fixed offset of a descriptor slice.
fn read_u32_le(data: &[u8], offset: usize) -> Option<u32> {
    data.get(offset..offset + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}
