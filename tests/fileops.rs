//! File data-path scenarios: create/read/write, delete-on-last-close,
//! truncate, and cross-verification through an independent FAT
//! implementation.

mod common;

use common::ImageSpec;
use fat32d::{FatFs, FsError};

#[test]
fn create_then_read_back() {
    let disk = ImageSpec::small().build();
    let mut fs = FatFs::mount(disk).unwrap();

    fs.mknod("/A.TXT").unwrap();
    let fh = fs.open("/A.TXT").unwrap();
    assert_eq!(fs.write(fh, 0, b"HI!").unwrap(), 3);
    fs.release(fh).unwrap();

    let fh = fs.open("/A.TXT").unwrap();
    let mut buf = [0u8; 8];
    let n = fs.read(fh, 0, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"HI!");
    fs.release(fh).unwrap();

    let attr = fs.getattr("/A.TXT").unwrap();
    assert_eq!(attr.size, 3);
    assert_eq!(attr.mode, fat32d::stat::S_IFREG | 0o755);
    assert_eq!(attr.ino, fh, "the inode is the starting cluster");
    assert_eq!(attr.blocks, 1);
}

#[test]
fn read_at_size_returns_zero() {
    let disk = ImageSpec::small().build();
    let mut fs = FatFs::mount(disk).unwrap();
    fs.mknod("/E.TXT").unwrap();
    let fh = fs.open("/E.TXT").unwrap();

    let mut buf = [0u8; 16];
    assert_eq!(fs.read(fh, 0, &mut buf).unwrap(), 0, "empty file");

    fs.write(fh, 0, b"abcd").unwrap();
    assert_eq!(fs.read(fh, 4, &mut buf).unwrap(), 0, "offset == size");
    assert!(matches!(
        fs.read(fh, 5, &mut buf),
        Err(FsError::EndOfFile)
    ));
    fs.release(fh).unwrap();
}

#[test]
fn write_past_size_is_rejected() {
    let disk = ImageSpec::small().build();
    let mut fs = FatFs::mount(disk).unwrap();
    fs.mknod("/W.TXT").unwrap();
    let fh = fs.open("/W.TXT").unwrap();

    assert!(matches!(
        fs.write(fh, 1, b"x"),
        Err(FsError::InvalidArgument)
    ));
    // appends start exactly at the size.
    assert_eq!(fs.write(fh, 0, b"ab").unwrap(), 2);
    assert_eq!(fs.write(fh, 2, b"cd").unwrap(), 2);
    assert_eq!(fs.getattr("/W.TXT").unwrap().size, 4);
    fs.release(fh).unwrap();
}

#[test]
fn delete_on_last_close() {
    let disk = ImageSpec::small().build();
    let mut fs = FatFs::mount(disk).unwrap();
    let cluster_size = 4096u64;

    fs.mknod("/D.TXT").unwrap();
    let fh = fs.open("/D.TXT").unwrap();
    // one allocated cluster plus one more from the append.
    let data = vec![0xABu8; cluster_size as usize + 1];
    fs.write(fh, 0, &data).unwrap();
    fs.release(fh).unwrap();

    let free_before = fs.free_clusters();

    let h1 = fs.open("/D.TXT").unwrap();
    let h2 = fs.open("/D.TXT").unwrap();
    assert_eq!(h1, h2, "duplicate opens share one identity");

    fs.unlink("/D.TXT").unwrap();

    // the slot is gone immediately, the data is not.
    assert!(matches!(fs.getattr("/D.TXT"), Err(FsError::NoEntry)));
    assert_eq!(fs.free_clusters(), free_before);

    fs.release(h1).unwrap();
    assert_eq!(fs.free_clusters(), free_before, "a reference is still open");

    fs.release(h2).unwrap();
    assert_eq!(
        fs.free_clusters(),
        free_before + 2,
        "last close returns both clusters"
    );
}

#[test]
fn truncate_shrink_then_grow() {
    let disk = ImageSpec::small().build();
    let mut fs = FatFs::mount(disk).unwrap();
    let kib = 1024usize;

    fs.mknod("/T.BIN").unwrap();
    let fh = fs.open("/T.BIN").unwrap();
    let pattern: Vec<u8> = (0..12 * kib).map(|i| (i % 251) as u8).collect();
    fs.write(fh, 0, &pattern).unwrap();
    fs.release(fh).unwrap();

    let free_after_write = fs.free_clusters();

    // 12 KiB occupies three 4 KiB clusters; 5 KiB needs two.
    fs.truncate("/T.BIN", 5 * kib as u64).unwrap();
    assert_eq!(fs.getattr("/T.BIN").unwrap().size, 5 * kib as u64);
    assert_eq!(fs.getattr("/T.BIN").unwrap().blocks, 2);
    assert_eq!(fs.free_clusters(), free_after_write + 1);

    fs.truncate("/T.BIN", 10 * kib as u64).unwrap();
    assert_eq!(fs.getattr("/T.BIN").unwrap().blocks, 3);
    assert_eq!(fs.free_clusters(), free_after_write);

    let fh = fs.open("/T.BIN").unwrap();
    let mut buf = vec![0u8; 10 * kib];
    assert_eq!(fs.read(fh, 0, &mut buf).unwrap(), 10 * kib);
    assert_eq!(&buf[..5 * kib], &pattern[..5 * kib], "kept bytes intact");
    assert!(
        buf[5 * kib..].iter().all(|&b| b == 0),
        "grown region reads back as zeros"
    );
    fs.release(fh).unwrap();
}

#[test]
fn truncate_to_zero_releases_every_cluster() {
    let disk = ImageSpec::small().build();
    let mut fs = FatFs::mount(disk).unwrap();
    let free_start = fs.free_clusters();

    fs.mknod("/Z.BIN").unwrap();
    let fh = fs.open("/Z.BIN").unwrap();
    fs.write(fh, 0, &vec![7u8; 9000]).unwrap();
    fs.release(fh).unwrap();
    assert_eq!(fs.free_clusters(), free_start - 3);

    fs.truncate("/Z.BIN", 0).unwrap();
    assert_eq!(fs.getattr("/Z.BIN").unwrap().size, 0);
    assert_eq!(fs.free_clusters(), free_start);

    // the file is still usable afterwards.
    let fh = fs.open("/Z.BIN").unwrap();
    fs.write(fh, 0, b"again").unwrap();
    fs.release(fh).unwrap();
    assert_eq!(fs.getattr("/Z.BIN").unwrap().size, 5);
}

// ─── Cross-verification through fatfs ──────────────────────────────────────────

#[test]
fn fatfs_reads_what_the_driver_wrote() {
    let disk = common::make_disk();
    let mut fs = FatFs::mount(disk).unwrap();

    fs.mknod("/OUT.TXT").unwrap();
    let fh = fs.open("/OUT.TXT").unwrap();
    fs.write(fh, 0, b"written by the driver").unwrap();
    fs.release(fh).unwrap();

    let mut disk = fs.into_device().unwrap();
    let back = common::read_via_fatfs(&mut disk, "OUT.TXT");
    assert_eq!(back, b"written by the driver");
}

#[test]
fn driver_reads_what_fatfs_wrote() {
    let content: Vec<u8> = (0..10_000u32).map(|i| (i ^ 0xA5) as u8).collect();
    let disk = common::disk_with_file("BIG.BIN", &content);
    let mut fs = FatFs::mount(disk).unwrap();

    let attr = fs.getattr("/BIG.BIN").unwrap();
    assert_eq!(attr.size, content.len() as u64);

    let fh = fs.open("/BIG.BIN").unwrap();
    let mut buf = vec![0u8; content.len()];
    assert_eq!(fs.read(fh, 0, &mut buf).unwrap(), content.len());
    assert_eq!(buf, content);

    // offset reads line up too.
    let mut tail = vec![0u8; 100];
    assert_eq!(fs.read(fh, 9_900, &mut tail).unwrap(), 100);
    assert_eq!(&tail[..], &content[9_900..]);
    fs.release(fh).unwrap();
}

#[test]
fn overwrite_survives_fatfs_roundtrip() {
    let disk = common::disk_with_file("OVER.TXT", b"original");
    let mut fs = FatFs::mount(disk).unwrap();

    let fh = fs.open("/OVER.TXT").unwrap();
    fs.write(fh, 0, b"replaced").unwrap();
    fs.release(fh).unwrap();

    let mut disk = fs.into_device().unwrap();
    assert_eq!(common::read_via_fatfs(&mut disk, "OVER.TXT"), b"replaced");
}

#[test]
fn empty_fatfs_file_accepts_writes() {
    // fatfs leaves cluster 0 in the slot of a file it never wrote to.
    let disk = common::disk_with_file("EMPTY.TXT", b"");
    let mut fs = FatFs::mount(disk).unwrap();

    let fh = fs.open("/EMPTY.TXT").unwrap();
    fs.write(fh, 0, b"no longer empty").unwrap();
    fs.release(fh).unwrap();

    let mut disk = fs.into_device().unwrap();
    assert_eq!(
        common::read_via_fatfs(&mut disk, "EMPTY.TXT"),
        b"no longer empty"
    );
}
