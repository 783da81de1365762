use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use otalink_frame::crc32;
use otalink_ota::hex;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::cmd::HashArgs;
use crate::exit::{io_error, CliResult, SUCCESS};
use crate::output::{print_report, OutputFormat, Report};

#[derive(Debug, Serialize, PartialEq, Eq)]
struct ImageDigest {
    path: String,
    size: u64,
    sha256: String,
    crc32: String,
}

impl Report for ImageDigest {
    fn rows(&self) -> Vec<(&'static str, String)> {
        vec![
            ("path", self.path.clone()),
            ("size", self.size.to_string()),
            ("sha256", self.sha256.clone()),
            ("crc32", self.crc32.clone()),
        ]
    }

    fn pretty(&self) -> String {
        format!("{}  {}  {} bytes  crc32={}", self.sha256, self.path, self.size, self.crc32)
    }
}

pub fn run(args: HashArgs, format: OutputFormat) -> CliResult<i32> {
    let digest = digest_file(&args.file)
        .map_err(|err| io_error(&format!("failed reading {}", args.file.display()), err))?;
    print_report(&digest, format);
    Ok(SUCCESS)
}

fn digest_file(path: &Path) -> std::io::Result<ImageDigest> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut sha = Sha256::new();
    let mut crc = crc32::CRC32_INIT;
    let mut size = 0u64;
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        sha.update(&buf[..n]);
        crc = crc32::update(&buf[..n], crc);
        size += n as u64;
    }
    Ok(ImageDigest {
        path: path.display().to_string(),
        size,
        sha256: hex(&sha.finalize()),
        crc32: format!("{:08x}", crc32::finalize(crc)),
    })
}
