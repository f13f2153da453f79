mod image;

#[macro_use]
extern crate clap;

use clap::Parser;
use snap_fs::{SnapFs, NDIRECT, NINDIRECT, T_DIR};
use std::path::PathBuf;

#[derive(Parser)]
#[clap(name = "snapfs-image")]
#[clap(version, about, long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 建一个文件系统镜像，可顺带打包主机上的文件。
    Mkfs(MkfsArgs),
    /// 列出镜像里一个目录的内容。
    Ls(LsArgs),
    /// 打印一个文件的块地址表（直接地址和间接地址）。
    Addrs(AddrsArgs),
}

fn main() {
    use Commands::*;
    match Cli::parse().command {
        Mkfs(args) => args.run(),
        Ls(args) => args.run(),
        Addrs(args) => args.run(),
    }
}

#[derive(Args)]
struct MkfsArgs {
    /// Path of the image to create.
    #[clap(long, default_value = "fs.img")]
    out: PathBuf,
    /// Total blocks of the image.
    #[clap(long, default_value_t = 4000)]
    size: u32,
    /// Inode table capacity.
    #[clap(long, default_value_t = 200)]
    ninodes: u32,
    /// Host files to pack into the root directory.
    files: Vec<PathBuf>,
}

impl MkfsArgs {
    fn run(self) {
        let device = image::create(&self.out, self.size);
        let fs = SnapFs::format(device, self.size, self.ninodes);
        for path in &self.files {
            let data = std::fs::read(path).unwrap_or_else(|e| panic!("{}: {e}", path.display()));
            let name = path.file_name().unwrap().to_str().unwrap();
            let root = fs.root_inode();
            let inode = {
                let _tx = fs.begin_op();
                fs.create(&root, name, snap_fs::T_FILE, 0, 0)
                    .expect("mkfs: create")
            };
            // 整页整页写，免得单个事务塞爆日志
            for (i, chunk) in data.chunks(4096).enumerate() {
                let written = inode.write_at((i * 4096) as u32, chunk);
                assert_eq!(written, Some(chunk.len()), "mkfs: write {name}");
            }
            println!("packed {name} ({} bytes)", data.len());
        }
        fs.sync_all();
        println!("image {} ready", self.out.display());
    }
}

#[derive(Args)]
struct LsArgs {
    /// Path of the image.
    #[clap(long, default_value = "fs.img")]
    img: PathBuf,
    /// Directory inside the image.
    #[clap(default_value = "/")]
    path: String,
}

impl LsArgs {
    fn run(self) {
        let fs = SnapFs::open(image::open(&self.img));
        let dir = fs.namei(&self.path).expect("ls: no such directory");
        let guard = dir.lock();
        assert_eq!(guard.ty(), T_DIR, "ls: not a directory");
        for (name, inum) in guard.entries() {
            println!("{inum:>4} {name}");
        }
    }
}

#[derive(Args)]
struct AddrsArgs {
    /// Path of the image.
    #[clap(long, default_value = "fs.img")]
    img: PathBuf,
    /// File inside the image.
    path: String,
}

impl AddrsArgs {
    fn run(self) {
        let fs = SnapFs::open(image::open(&self.img));
        let inode = fs.namei(&self.path).expect("addrs: no such file");
        let guard = inode.lock();
        let addrs = guard.addrs();
        for (i, addr) in addrs.iter().enumerate().take(NDIRECT) {
            if *addr != 0 {
                println!("addr[{i}]: {addr:x}");
            }
        }
        if addrs[NDIRECT] != 0 {
            println!("addr[{}]: {:x}(INDIRECT POINTER)", NDIRECT, addrs[NDIRECT]);
            for i in 0..NINDIRECT {
                let addr = guard.bmmap(NDIRECT + i);
                if addr != 0 {
                    println!("addr[{}]->[{}](bn: {}): {:x}", NDIRECT, i, NDIRECT + i, addr);
                }
            }
        }
    }
}
