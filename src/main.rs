use std::env;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;

use rustls_pemfile::{certs, pkcs8_private_keys};
use warp::Filter;

use library_hub::server::{self, Server};
use library_hub::store::FileStore;

const CERT_PATH: &str = "ssl/certificate.pem";
const KEY_PATH: &str = "ssl/private.key";

fn tls_material_ready() -> bool {
    let cert_file = match File::open(CERT_PATH) {
        Ok(file) => file,
        Err(e) => {
            log::debug!("no TLS certificate at {CERT_PATH}: {e}");
            return false;
        }
    };
    let key_file = match File::open(KEY_PATH) {
        Ok(file) => file,
        Err(e) => {
            log::debug!("no TLS private key at {KEY_PATH}: {e}");
            return false;
        }
    };

    let parsed_certs: Vec<_> =
        match certs(&mut BufReader::new(cert_file)).collect::<std::io::Result<Vec<_>>>() {
            Ok(parsed) => parsed,
            Err(e) => {
                eprintln!("Failed to parse certificate: {e}");
                return false;
            }
        };
    let parsed_keys: Vec<_> = match pkcs8_private_keys(&mut BufReader::new(key_file))
        .collect::<std::io::Result<Vec<_>>>()
    {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("Failed to parse private key: {e}");
            return false;
        }
    };

    !parsed_certs.is_empty() && !parsed_keys.is_empty()
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let addr = env_or("LIBRARY_HUB_ADDR", "0.0.0.0");
    let port = env_or("LIBRARY_HUB_PORT", "2052");
    let data_dir = env_or("LIBRARY_HUB_DATA", "data");
    let static_dir = env_or("LIBRARY_HUB_STATIC", "public");

    let bind: SocketAddr = match format!("{addr}:{port}").parse() {
        Ok(bind) => bind,
        Err(e) => {
            eprintln!("Invalid bind address {addr}:{port}: {e}");
            return;
        }
    };

    let store = match FileStore::new(&data_dir).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("Failed to open data directory {data_dir}: {e}");
            return;
        }
    };

    let server = match Server::load(store).await {
        Ok(server) => Arc::new(server),
        Err(e) => {
            eprintln!("Failed to load persisted state: {e}");
            return;
        }
    };
    if let Err(e) = server.users.ensure_owner().await {
        eprintln!("Failed to seed owner account: {e}");
        return;
    }

    let api = server::routes(server);
    let static_files = warp::fs::dir(static_dir);
    let routes = api
        .or(static_files)
        .with(warp::cors().allow_any_origin());

    if tls_material_ready() {
        println!("Starting secure server (HTTPS) on {bind}...");
        warp::serve(routes)
            .tls()
            .cert_path(CERT_PATH)
            .key_path(KEY_PATH)
            .run(bind)
            .await;
    } else {
        println!("No usable TLS material, serving plain HTTP on {bind}...");
        warp::serve(routes).run(bind).await;
    }
}
