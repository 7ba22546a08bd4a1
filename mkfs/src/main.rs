//! Builds an fv6 file-system image.
//!
//! ```text
//! mkfs fs.img [file...]
//! ```
//!
//! Lays out boot block | super block | log | inode table | bitmap | data,
//! creates the root directory, and copies each named file into it (path
//! prefixes and a leading `_` are stripped from the stored name, so
//! `user/_init` lands as `/init`).
//!
//! Assumes a little-endian host, like the RISC-V target it feeds.

use std::{
    env,
    fs::File,
    io::{self, Read as _, Seek as _, SeekFrom, Write as _},
    path::Path,
    process,
};

use dataview::{Pod, PodMethods as _};
use fv6_fs_types::{
    BLOCK_SIZE, BPB, BlockNo, Dinode, DirEntry, IPB, IndirectBlock, InodeBlock, InodeNo,
    MAX_FILE_BLOCKS, NAME_LEN, NDIRECT, SuperBlock, T_DIR, T_FILE,
};
use fv6_kernel_params::{FS_SIZE, LOG_SIZE, NUM_FS_INODES};

fn main() -> io::Result<()> {
    let args: Vec<String> = env::args().collect();
    let Some((image, files)) = args[1..].split_first() else {
        eprintln!("usage: {} fs.img [file...]", args[0]);
        process::exit(1);
    };

    let mut builder = ImageBuilder::create(Path::new(image))?;
    for path in files {
        let mut content = Vec::new();
        File::open(path)?.read_to_end(&mut content)?;
        builder.add_file(stored_name(path), &content)?;
    }
    builder.finish()
}

/// `user/_cat` is stored as `cat`.
fn stored_name(path: &str) -> &str {
    let base = path.rsplit('/').next().unwrap_or(path);
    let base = base.strip_prefix('_').unwrap_or(base);
    assert!(base.len() < NAME_LEN, "name too long: {base}");
    base
}

/// A block-sized scratch buffer, aligned so the on-disk structures can be
/// viewed in place.
#[repr(C, align(8))]
#[derive(Clone)]
struct Block([u8; BLOCK_SIZE]);

impl Block {
    fn zeroed() -> Self {
        Self([0; BLOCK_SIZE])
    }

    fn view<T: Pod>(&self) -> &T {
        self.0.as_data_view().get(0)
    }

    fn view_mut<T: Pod>(&mut self) -> &mut T {
        self.0.as_data_view_mut().get_mut(0)
    }
}

struct ImageBuilder {
    img: File,
    sb: SuperBlock,
    next_inode: u32,
    next_block: u32,
}

impl ImageBuilder {
    /// Creates a zeroed image with a valid superblock and an empty root
    /// directory.
    fn create(path: &Path) -> io::Result<Self> {
        let nbitmap = (FS_SIZE / BPB + 1) as u32;
        let ninodeblocks = (NUM_FS_INODES / IPB + 1) as u32;
        let nlog = LOG_SIZE as u32;
        // 2 = boot block + super block.
        let nmeta = 2 + nlog + ninodeblocks + nbitmap;

        let sb = SuperBlock {
            magic: SuperBlock::MAGIC,
            size: FS_SIZE as u32,
            nblocks: FS_SIZE as u32 - nmeta,
            ninodes: NUM_FS_INODES as u32,
            nlog,
            logstart: 2,
            inodestart: 2 + nlog,
            bmapstart: 2 + nlog + ninodeblocks,
        };
        eprintln!(
            "nmeta {nmeta} (boot, super, log {nlog}, inode {ninodeblocks}, bitmap {nbitmap}) \
             data {} total {FS_SIZE}",
            sb.nblocks,
        );

        let img = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        img.set_len((FS_SIZE * BLOCK_SIZE) as u64)?;

        let mut builder = Self {
            img,
            sb,
            next_inode: 1,
            next_block: nmeta,
        };

        let mut sb_block = Block::zeroed();
        sb_block.0[..size_of::<SuperBlock>()].copy_from_slice(builder.sb.as_bytes());
        builder.write_block(BlockNo::SUPER_BLOCK, &sb_block)?;

        let root = builder.alloc_inode(T_DIR)?;
        assert_eq!(root, InodeNo::ROOT);
        builder.link(root, root, ".")?;
        builder.link(root, root, "..")?;

        Ok(builder)
    }

    /// Adds a regular file to the root directory.
    fn add_file(&mut self, name: &str, content: &[u8]) -> io::Result<()> {
        let ino = self.alloc_inode(T_FILE)?;
        self.append(ino, content)?;
        self.link(InodeNo::ROOT, ino, name)
    }

    /// Pads the root directory to a block boundary and writes the bitmap.
    fn finish(&mut self) -> io::Result<()> {
        let mut root = self.read_inode(InodeNo::ROOT)?;
        root.size = root.size.next_multiple_of(BLOCK_SIZE as u32);
        self.write_inode(InodeNo::ROOT, &root)?;

        // Every block below next_block is in use; the image is small
        // enough for one bitmap block.
        let used = self.next_block as usize;
        assert!(used < BPB);
        let mut bitmap = Block::zeroed();
        for bn in 0..used {
            bitmap.0[bn / 8] |= 1 << (bn % 8);
        }
        eprintln!("balloc: first {used} blocks allocated");
        self.write_block(BlockNo::new(self.sb.bmapstart), &bitmap)
    }

    fn seek(&mut self, bn: BlockNo) -> io::Result<()> {
        self.img
            .seek(SeekFrom::Start(bn.as_index() as u64 * BLOCK_SIZE as u64))?;
        Ok(())
    }

    fn write_block(&mut self, bn: BlockNo, data: &Block) -> io::Result<()> {
        self.seek(bn)?;
        self.img.write_all(&data.0)
    }

    fn read_block(&mut self, bn: BlockNo) -> io::Result<Block> {
        let mut block = Block::zeroed();
        self.seek(bn)?;
        self.img.read_exact(&mut block.0)?;
        Ok(block)
    }

    fn read_inode(&mut self, ino: InodeNo) -> io::Result<Dinode> {
        let block = self.read_block(self.sb.inode_block(ino))?;
        Ok(block.view::<InodeBlock>().inode(ino).clone())
    }

    fn write_inode(&mut self, ino: InodeNo, dinode: &Dinode) -> io::Result<()> {
        let bn = self.sb.inode_block(ino);
        let mut block = self.read_block(bn)?;
        *block.view_mut::<InodeBlock>().inode_mut(ino) = dinode.clone();
        self.write_block(bn, &block)
    }

    fn alloc_inode(&mut self, ty: i16) -> io::Result<InodeNo> {
        let ino = InodeNo::new(self.next_inode);
        self.next_inode += 1;
        assert!(self.next_inode <= self.sb.ninodes);

        let mut dinode = Dinode::zeroed();
        dinode.allocate(ty);
        dinode.nlink = 1;
        self.write_inode(ino, &dinode)?;
        Ok(ino)
    }

    fn alloc_block(&mut self) -> BlockNo {
        let bn = BlockNo::new(self.next_block);
        self.next_block += 1;
        assert!(self.next_block <= self.sb.size, "image out of space");
        bn
    }

    /// Appends a directory entry for `ino` to directory `dir`.
    fn link(&mut self, dir: InodeNo, ino: InodeNo, name: &str) -> io::Result<()> {
        let mut entry = DirEntry::zeroed();
        entry.set_ino(Some(ino));
        entry.set_name(name.as_bytes());
        self.append(dir, entry.as_bytes())
    }

    /// Appends bytes to an inode, allocating direct and indirect blocks
    /// as needed.
    fn append(&mut self, ino: InodeNo, mut data: &[u8]) -> io::Result<()> {
        let mut dinode = self.read_inode(ino)?;
        let mut off = dinode.size as usize;

        while !data.is_empty() {
            let fbn = off / BLOCK_SIZE;
            assert!(fbn < MAX_FILE_BLOCKS, "file too large");
            let bn = if fbn < NDIRECT {
                match dinode.addr(fbn) {
                    Some(bn) => bn,
                    None => {
                        let bn = self.alloc_block();
                        dinode.set_addr(fbn, Some(bn));
                        bn
                    }
                }
            } else {
                let ind_bn = match dinode.addr(NDIRECT) {
                    Some(bn) => bn,
                    None => {
                        let bn = self.alloc_block();
                        dinode.set_addr(NDIRECT, Some(bn));
                        bn
                    }
                };
                let mut ind_block = self.read_block(ind_bn)?;
                let (bn, grew) = {
                    let ind: &mut IndirectBlock = ind_block.view_mut();
                    match ind.get(fbn - NDIRECT) {
                        Some(bn) => (bn, false),
                        None => {
                            let bn = self.alloc_block();
                            ind.set(fbn - NDIRECT, Some(bn));
                            (bn, true)
                        }
                    }
                };
                if grew {
                    self.write_block(ind_bn, &ind_block)?;
                }
                bn
            };

            let block_end = (fbn + 1) * BLOCK_SIZE;
            let n = usize::min(data.len(), block_end - off);
            let mut block = self.read_block(bn)?;
            block.0[off % BLOCK_SIZE..][..n].copy_from_slice(&data[..n]);
            self.write_block(bn, &block)?;

            off += n;
            data = &data[n..];
        }

        dinode.size = off as u32;
        self.write_inode(ino, &dinode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TempImage(std::path::PathBuf);

    impl Drop for TempImage {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    fn temp_image(name: &str) -> TempImage {
        let mut path = std::env::temp_dir();
        path.push(format!("fv6-mkfs-test-{name}-{}", process::id()));
        TempImage(path)
    }

    /// Reads a file's full contents back out of the image.
    fn read_file(builder: &mut ImageBuilder, ino: InodeNo) -> Vec<u8> {
        let dinode = builder.read_inode(ino).unwrap();
        let mut out = Vec::new();
        for fbn in 0..dinode.size.div_ceil(BLOCK_SIZE as u32) as usize {
            let bn = if fbn < NDIRECT {
                dinode.addr(fbn).unwrap()
            } else {
                let ind_block = builder.read_block(dinode.addr(NDIRECT).unwrap()).unwrap();
                ind_block.view::<IndirectBlock>().get(fbn - NDIRECT).unwrap()
            };
            out.extend_from_slice(&builder.read_block(bn).unwrap().0);
        }
        out.truncate(dinode.size as usize);
        out
    }

    fn lookup(builder: &mut ImageBuilder, name: &[u8]) -> Option<InodeNo> {
        let root = builder.read_inode(InodeNo::ROOT).unwrap();
        for fbn in 0..root.size.div_ceil(BLOCK_SIZE as u32) as usize {
            let block = builder.read_block(root.addr(fbn).unwrap()).unwrap();
            for off in (0..BLOCK_SIZE).step_by(size_of::<DirEntry>()) {
                let entry: &DirEntry = block.0.as_data_view().get(off);
                if entry.ino().is_some() && entry.name_matches(name) {
                    return entry.ino();
                }
            }
        }
        None
    }

    #[test]
    fn image_has_valid_geometry() {
        let tmp = temp_image("geometry");
        let mut builder = ImageBuilder::create(&tmp.0).unwrap();
        builder.finish().unwrap();

        let block = builder.read_block(BlockNo::SUPER_BLOCK).unwrap();
        let sb: &SuperBlock = block.view();
        assert_eq!(sb.magic, SuperBlock::MAGIC);
        assert_eq!(sb.size as usize, FS_SIZE);
        assert_eq!(sb.logstart, 2);
        assert_eq!(sb.inodestart, 2 + LOG_SIZE as u32);
        // Log region is clean.
        let log_header = builder.read_block(sb.log_header_block()).unwrap();
        assert!(log_header.0.iter().all(|&b| b == 0));
    }

    #[test]
    fn root_directory_has_dot_entries() {
        let tmp = temp_image("root");
        let mut builder = ImageBuilder::create(&tmp.0).unwrap();
        builder.finish().unwrap();

        assert_eq!(lookup(&mut builder, b"."), Some(InodeNo::ROOT));
        assert_eq!(lookup(&mut builder, b".."), Some(InodeNo::ROOT));
        let root = builder.read_inode(InodeNo::ROOT).unwrap();
        assert_eq!(root.ty, T_DIR);
        assert_eq!(root.size as usize % BLOCK_SIZE, 0);
    }

    #[test]
    fn file_contents_round_trip() {
        let tmp = temp_image("roundtrip");
        let mut builder = ImageBuilder::create(&tmp.0).unwrap();
        // Spans several direct blocks and exercises the indirect block.
        let content: Vec<u8> = (0..(NDIRECT + 3) * BLOCK_SIZE + 123)
            .map(|i| (i % 251) as u8)
            .collect();
        builder.add_file("big", &content).unwrap();
        builder.finish().unwrap();

        let ino = lookup(&mut builder, b"big").expect("file linked in root");
        let back = read_file(&mut builder, ino);
        assert_eq!(back, content);

        let dinode = builder.read_inode(ino).unwrap();
        assert_eq!(dinode.ty, T_FILE);
        assert_eq!(dinode.nlink, 1);
        assert!(dinode.addr(NDIRECT).is_some(), "indirect block in use");
    }

    #[test]
    fn stored_names_are_stripped() {
        assert_eq!(stored_name("user/_init"), "init");
        assert_eq!(stored_name("target/release/cat"), "cat");
        assert_eq!(stored_name("echo"), "echo");
    }
}
