// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the modsim project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Modbus server implementation for simulated slave devices
//!
//! For avoiding confusion with the Modbus master/slave terminology, this
//! module uses the terms "server" and "client" instead. The server is the
//! device that provides data, while the client is the device that requests
//! data: the Modbus master is here the client and the Modbus slave is here
//! the server.
//!
//! Every simulation runs one instance of this service per client
//! connection. The service holds a handle to the simulation's register
//! bank and translates the three supported holding-register function
//! codes onto it:
//!
//! | Function code | Mapping |
//! |---------------|---------|
//! | 0x03 Read Holding Registers | `RegisterBank::read_words` |
//! | 0x06 Write Single Register | `RegisterBank::write_words` (one word) |
//! | 0x10 Write Multiple Registers | `RegisterBank::write_words` |
//!
//! The bank validates every access: reads beyond the register space and
//! writes that do not exactly cover writable registers come back as
//! Illegal Data Address (exception 02). Out-of-range values for bounded
//! writable registers are clamped and accepted, with the coercion logged.
//! Any other function code is answered with Illegal Function
//! (exception 01).

use std::{future, sync::Arc};

use log::{debug, error};

use tokio_modbus::prelude::*;

use crate::simulation::bank::{AccessError, RegisterBank};

/// A Modbus TCP service serving one simulation's register bank.
///
/// The service is cheap to clone per connection: it only holds an `Arc`
/// to the bank, whose internal mutex serializes concurrent requests
/// against the update loop.
pub struct SimulatorModbusServer {
    bank: Arc<RegisterBank>,
}

impl SimulatorModbusServer {
    /// Create a service backed by the given register bank.
    pub fn new(bank: &Arc<RegisterBank>) -> Self {
        Self {
            bank: Arc::clone(bank),
        }
    }
}

impl tokio_modbus::server::Service for SimulatorModbusServer {
    type Request = Request<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = future::Ready<Result<Self::Response, Self::Exception>>;

    /// Process a Modbus request and provide a response.
    ///
    /// Handles function codes 0x03, 0x06 and 0x10; any other function
    /// code returns an IllegalFunction exception.
    fn call(&self, req: Self::Request) -> Self::Future {
        debug!("Received Modbus request: {:?}", req);

        let res = match req {
            Request::ReadHoldingRegisters(addr, cnt) => {
                debug!(
                    "Reading {} holding registers starting from address {}",
                    cnt, addr
                );
                self.bank
                    .read_words(addr, cnt)
                    .map(Response::ReadHoldingRegisters)
                    .map_err(access_exception)
            }
            Request::WriteSingleRegister(addr, value) => {
                debug!("Writing value {} to holding register {}", value, addr);
                self.bank
                    .write_words(addr, std::slice::from_ref(&value))
                    .map(|_| Response::WriteSingleRegister(addr, value))
                    .map_err(access_exception)
            }
            Request::WriteMultipleRegisters(addr, values) => {
                debug!(
                    "Writing {} values to holding registers starting from address {}",
                    values.len(),
                    addr
                );
                self.bank
                    .write_words(addr, &values)
                    .map(|_| Response::WriteMultipleRegisters(addr, values.len() as u16))
                    .map_err(access_exception)
            }
            _ => {
                error!(
                    "Exception::IllegalFunction - Unimplemented function code in request: {req:?}"
                );
                Err(ExceptionCode::IllegalFunction)
            }
        };

        if let Err(e) = &res {
            error!("Modbus request error: {:?}", e);
        }

        future::ready(res)
    }
}

/// Map a rejected bank access onto the wire exception code.
fn access_exception(err: AccessError) -> ExceptionCode {
    error!("Exception::IllegalDataAddress - {}", err);
    ExceptionCode::IllegalDataAddress
}
