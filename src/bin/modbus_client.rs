// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the modsim project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

use clap::Parser;
use std::{error::Error, net::SocketAddr};
use tokio_modbus::prelude::*;

/// Modbus client for inspecting a simulated slave device
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Modbus server address
    #[clap(long, default_value = "127.0.0.1")]
    address: String,

    /// Modbus server port
    #[clap(long, default_value = "5020")]
    port: u16,

    /// Slave id to address
    #[clap(long, default_value = "1")]
    slave_id: u8,

    /// Starting holding register address (0-based)
    #[clap(long, default_value = "0")]
    register: u16,

    /// Number of registers to read
    #[clap(long, default_value = "9")]
    quantity: u16,

    /// Write this value to the starting register (function code 6)
    /// before reading
    #[clap(long)]
    write: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Initialize logging
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    // Parse command line arguments
    let args = Args::parse();

    // Format server address
    let socket_addr: SocketAddr = format!("{}:{}", args.address, args.port)
        .parse()
        .expect("Invalid socket address");
    println!("Connecting to Modbus server at {}", socket_addr);

    // Create TCP transport
    let mut ctx = tcp::connect_slave(socket_addr, Slave(args.slave_id)).await?;

    if let Some(value) = args.write {
        println!("Writing {} to holding register {}", value, args.register);
        match ctx.write_single_register(args.register, value).await? {
            Ok(_) => println!("Write accepted"),
            Err(exception) => println!("Write rejected: {}", exception),
        }
    }

    // Read holding registers
    println!(
        "Reading {} holding registers starting at address {}",
        args.quantity, args.register
    );
    match ctx.read_holding_registers(args.register, args.quantity).await? {
        Ok(response) => {
            println!("Raw register values: {:?}", response);
            for (i, value) in response.iter().enumerate() {
                let register = args.register + i as u16;
                println!(
                    "Register {} (display {}): {:#06x} = {}",
                    register,
                    40_001 + u32::from(register),
                    value,
                    value
                );
            }
        }
        Err(exception) => println!("Read rejected: {}", exception),
    }

    ctx.disconnect().await?;
    Ok(())
}
