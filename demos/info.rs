//! Query device identity over the control channel without streaming.
//!
//! Usage: cargo run --example info [host]

use xreal_one::{Client, ClientConfig, NetOptions};

fn main() {
    env_logger::init();

    let mut config = ClientConfig::default();
    if let Some(host) = std::env::args().nth(1) {
        config.net = NetOptions {
            host,
            ..NetOptions::default()
        };
    }

    let client = Client::new(config);
    match client.get_id() {
        Ok(id) => println!("device id:        {id}"),
        Err(e) => {
            eprintln!("failed to reach glasses: {e}");
            std::process::exit(1);
        }
    }
    match client.get_software_version() {
        Ok(v) => println!("software version: {v}"),
        Err(e) => eprintln!("software version: <{e}>"),
    }
    match client.get_dsp_version() {
        Ok(v) => println!("dsp version:      {v}"),
        Err(e) => eprintln!("dsp version:      <{e}>"),
    }
    match client.get_config() {
        Ok(config) => {
            println!("fsn:              {}", config.fsn);
            println!("glasses version:  {}", config.glasses_version);
            println!("calibrated:       {}", config.last_modified_time);
        }
        Err(e) => eprintln!("config:           <{e}>"),
    }
    client.stop();
}
