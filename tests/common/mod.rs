#![allow(dead_code)]

use extrabms_lib::poller::{Sink, Transport};
use extrabms_lib::protocol::Command;
use extrabms_lib::telemetry::{ModuleRecord, SystemRecord};
use extrabms_lib::Error;
use std::collections::{HashMap, VecDeque};

/// What one module answers to one `pwr`/`bat` pair.
#[derive(Debug, Clone)]
pub enum Reply {
    Module(ModuleState),
    Timeout,
    Garbage,
}

#[derive(Debug, Clone)]
pub struct ModuleState {
    pub soc: u32,
    pub temperature_mc: i32,
    pub cells_mv: Vec<u32>,
    pub events: [u32; 3],
}

impl Default for ModuleState {
    fn default() -> Self {
        Self {
            soc: 60,
            temperature_mc: 25000,
            cells_mv: vec![3310, 3320, 3305, 3315],
            events: [0; 3],
        }
    }
}

pub fn power_reply(address: u8, state: &ModuleState) -> Vec<u8> {
    let voltage_mv: u32 = state.cells_mv.iter().sum();
    format!(
        "pwr {address}\r\n@\r\n\
         Voltage         : {voltage_mv} mV\r\n\
         Current         : -10000 mA\r\n\
         Temperature     : {} mC\r\n\
         Coulomb         : {} %\r\n\
         Total Coulomb   : 50000 mAH\r\n\
         Bat Events      : 0x{:X}\r\n\
         Power Events    : 0x{:X}\r\n\
         System Fault    : 0x{:X}\r\n\
         Charge Times    : 42\r\n\
         Command completed successfully\r\n$$\r\npylon_debug>",
        state.temperature_mc, state.soc, state.events[0], state.events[1], state.events[2]
    )
    .into_bytes()
}

pub fn cell_reply(address: u8, state: &ModuleState) -> Vec<u8> {
    let mut reply = format!(
        "bat {address}\r\n@\r\nBattery  Volt     Curr     Tempr    Base State   Volt. State  Curr. State  Temp. State  SOC          Coulomb      BAL\r\n"
    );
    for (i, mv) in state.cells_mv.iter().enumerate() {
        reply.push_str(&format!(
            "{i}        {mv}     -10000   {}    Dischg       Normal       Normal       Normal       {}%          30000 mAH    N\r\n",
            state.temperature_mc, state.soc
        ));
    }
    reply.push_str("Command completed successfully\r\n$$\r\npylon_debug>");
    reply.into_bytes()
}

pub fn info_reply(address: u8, charge_ma: i32, discharge_ma: i32, cells: usize) -> Vec<u8> {
    format!(
        "info {address}\r\n@\r\n\
         Device address      : {address}\r\n\
         Barcode             : HPTBH0224{address:04}\r\n\
         Cell Count          : {cells}\r\n\
         Max Charge Curr     : {charge_ma} mA\r\n\
         Max Dischg Curr     : {discharge_ma} mA\r\n\
         Command completed successfully\r\n$$\r\npylon_debug>"
    )
    .into_bytes()
}

/// In-memory module string. Each address answers from its script first and
/// falls back to a fixed reply once the script is used up.
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: HashMap<u8, VecDeque<Reply>>,
    fallback: HashMap<u8, Reply>,
    info: HashMap<u8, Vec<u8>>,
    current: HashMap<u8, ModuleState>,
    pub commands: Vec<Command>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn always(mut self, address: u8, reply: Reply) -> Self {
        self.fallback.insert(address, reply);
        self
    }

    pub fn then(mut self, address: u8, reply: Reply) -> Self {
        self.scripts.entry(address).or_default().push_back(reply);
        self
    }

    pub fn info(mut self, address: u8, reply: Vec<u8>) -> Self {
        self.info.insert(address, reply);
        self
    }
}

impl Transport for ScriptedTransport {
    fn exchange(&mut self, command: &Command) -> Result<Vec<u8>, Error> {
        self.commands.push(*command);
        let address = command.address();
        match command {
            Command::Power(_) => {
                let reply = self
                    .scripts
                    .get_mut(&address)
                    .and_then(VecDeque::pop_front)
                    .or_else(|| self.fallback.get(&address).cloned())
                    .unwrap_or(Reply::Timeout);
                match reply {
                    Reply::Module(state) => {
                        let bytes = power_reply(address, &state);
                        self.current.insert(address, state);
                        Ok(bytes)
                    }
                    Reply::Timeout => Err(Error::TransportTimeout { address }),
                    Reply::Garbage => Ok(b"pwr 1\r\n\xff\xfe Voltage : ".to_vec()),
                }
            }
            Command::Cells(_) => match self.current.remove(&address) {
                Some(state) => Ok(cell_reply(address, &state)),
                None => Ok(b"bat\r\n".to_vec()),
            },
            Command::Info(_) => self
                .info
                .get(&address)
                .cloned()
                .ok_or(Error::TransportTimeout { address }),
        }
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub modules: Vec<ModuleRecord>,
    pub systems: Vec<SystemRecord>,
    pub fail: bool,
}

impl Sink for RecordingSink {
    fn publish_module(&mut self, record: &ModuleRecord) -> Result<(), Error> {
        self.modules.push(record.clone());
        if self.fail {
            return Err(Error::Publish("broker unreachable".into()));
        }
        Ok(())
    }

    fn publish_system(&mut self, record: &SystemRecord) -> Result<(), Error> {
        self.systems.push(record.clone());
        if self.fail {
            return Err(Error::Publish("broker unreachable".into()));
        }
        Ok(())
    }
}
