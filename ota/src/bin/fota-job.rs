use clap::{Arg, ArgAction, Command};
use sha2::{Digest, Sha256};
use std::path::PathBuf;

use ota::job::{OtaJobConfig, OtaPhase};
use storage::kv;

fn main() {
    let matches = Command::new("fota-job")
        .about("Writes the fota.json and boot.json files that make a device fetch and install <FILE>.")
        .arg(clap::arg!(<FILE> "The firmware image the device will download").required(true))
        .arg(clap::arg!(--server <HOST> "Host serving the image over HTTPS").required(true))
        .arg(clap::arg!(--port <PORT> "HTTPS port").default_value("443"))
        .arg(
            clap::arg!(--path <PATH> "Path of the image on the server, defaults to /<file name>"),
        )
        .arg(clap::arg!(--name <NAME> "Image name recorded in the partition table").required(true))
        .arg(
            Arg::new("image-version")
                .long("image-version")
                .value_name("VERSION")
                .help("Image version")
                .default_value("0.0.0"),
        )
        .arg(clap::arg!(--ssid <SSID> "WiFi network").required(true))
        .arg(clap::arg!(--passphrase <PASS> "WiFi passphrase").default_value(""))
        .arg(clap::arg!(--args <ARGS> "Boot arguments for the new image").default_value(""))
        .arg(clap::arg!(-o --out <DIR> "Directory receiving the files").default_value("."))
        .arg(
            clap::arg!(--provision "Leave the device in provisioning mode instead of upgrading")
                .action(ArgAction::SetTrue),
        )
        .get_matches();
    let Some(file_path) = matches.get_one::<String>("FILE") else {
        eprintln!("Error: No file provided");
        std::process::exit(1);
    };

    let file_path = PathBuf::from(file_path);
    let image = match std::fs::read(&file_path) {
        Ok(image) => image,
        Err(e) => {
            eprintln!("Error: cannot read '{}': {}", file_path.display(), e);
            std::process::exit(1);
        }
    };

    let Ok(filesize) = u32::try_from(image.len()) else {
        eprintln!("Error: '{}' is too large", file_path.display());
        std::process::exit(1);
    };

    let arg = |id: &str| {
        matches
            .get_one::<String>(id)
            .map(String::as_str)
            .unwrap_or_default()
    };

    let default_path = format!(
        "/{}",
        file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    );
    let remote_path = matches
        .get_one::<String>("path")
        .map(String::as_str)
        .unwrap_or(&default_path);

    let mut job = OtaJobConfig::blank();
    job.phase = if matches.get_flag("provision") {
        OtaPhase::Provisioning
    } else {
        OtaPhase::Upgrade
    };
    job.ssid = kv::truncated(arg("ssid"));
    job.passphrase = kv::truncated(arg("passphrase"));
    job.server = kv::truncated(arg("server"));
    job.server_port = kv::truncated(arg("port"));
    job.name = kv::truncated(arg("name"));
    job.version = kv::truncated(arg("image-version"));
    job.filename = kv::truncated(remote_path);
    job.filesize = filesize;
    job.args = kv::truncated(arg("args"));
    job.param_count = u32::from(!job.args.is_empty());

    let mut digest = [0u8; 32];
    digest.copy_from_slice(&Sha256::digest(&image));
    job.set_expected_digest(&digest);

    if job.filename.as_str() != remote_path {
        eprintln!(
            "Error: remote path '{}' exceeds {} bytes",
            remote_path,
            ota::job::FILENAME_LEN
        );
        std::process::exit(1);
    }

    let Ok(fota_json) = job.to_file() else {
        eprintln!("Error: job does not fit {} bytes", ota::job::JOB_FILE_LEN);
        std::process::exit(1);
    };

    let out = PathBuf::from(arg("out"));
    for (name, contents) in [
        ("fota.json", fota_json.as_str().to_owned()),
        ("boot.json", "{image : 0}\n".to_owned()),
    ] {
        let path = out.join(name);
        if let Err(e) = std::fs::write(&path, contents) {
            eprintln!("Error: cannot write '{}': {}", path.display(), e);
            std::process::exit(1);
        }
        println!("Wrote {}", path.display());
    }

    println!(
        "Image {} bytes, sha256 {}",
        filesize,
        job.hash.as_str()
    );

    std::process::exit(0);
}
