//! 内存回环模拟
//!
//! 客户端与模拟设备通过两个队列相连，不需要蓝牙硬件。

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Result, bail};
use sesame_core::crypto::CryptoContext;
use sesame_core::{
    ClientState, ItemCode, MechSetting5, MechStatus5, Model, OpCode, OsVersion, ResultCode,
    ServerBleBackend, SesameBleBackend, SesameClientCore, SesameServerCore,
};
use uuid::Uuid;

const SESSION: u16 = 1;
const LOCK_POSITION: i16 = 0;
const UNLOCK_POSITION: i16 = 256;

type Queue = Rc<RefCell<VecDeque<Vec<u8>>>>;

struct Central(Queue);

impl SesameBleBackend for Central {
    fn write_to_tx(&mut self, data: &[u8]) -> bool {
        self.0.borrow_mut().push_back(data.to_vec());
        true
    }

    fn disconnect(&mut self) {
        log::info!("Client requested disconnect");
    }
}

struct Peripheral(Queue);

impl ServerBleBackend for Peripheral {
    fn write_to_central(&mut self, _session_id: u16, data: &[u8]) -> bool {
        self.0.borrow_mut().push_back(data.to_vec());
        true
    }

    fn disconnect(&mut self, session_id: u16) {
        log::info!("Device dropped session {session_id}");
    }
}

struct Simulation {
    client: SesameClientCore<Central>,
    device: SesameServerCore<Peripheral>,
    to_device: Queue,
    to_client: Queue,
    commands: Rc<RefCell<Vec<ItemCode>>>,
}

impl Simulation {
    fn pump(&mut self) {
        loop {
            let c2p = self.to_device.borrow_mut().pop_front();
            if let Some(fragment) = &c2p {
                if let Err(e) = self.device.on_received(SESSION, fragment) {
                    log::warn!("Device rejected fragment: {e}");
                }
            }
            let p2c = self.to_client.borrow_mut().pop_front();
            if let Some(fragment) = &p2c {
                self.client.on_received(fragment);
            }
            if c2p.is_none() && p2c.is_none() {
                break;
            }
        }
    }

    /// 执行设备收到的命令，并像真实设备一样推送新状态
    fn actuate(&mut self) -> Result<()> {
        let pending: Vec<ItemCode> = self.commands.borrow_mut().drain(..).collect();
        for item in pending {
            let in_lock = match item {
                ItemCode::Lock => true,
                ItemCode::Unlock => false,
                _ => continue,
            };
            let position = if in_lock { LOCK_POSITION } else { UNLOCK_POSITION };
            let status = MechStatus5 {
                battery: 3000,
                target: position,
                position,
                in_lock,
                is_unlock_range: !in_lock,
                is_stop: true,
                ..Default::default()
            };
            self.device.set_mech_status(status);
            self.device
                .send_notify(None, OpCode::Publish, ItemCode::MechStatus, &status.to_bytes())?;
            self.pump();
        }
        Ok(())
    }
}

pub fn run(model: Model, tag: &str) -> Result<()> {
    if model.os_version() != OsVersion::Os3 {
        bail!("{model} cannot be simulated, only OS3 models are supported");
    }

    let mut ctx = CryptoContext::new()?;
    let mut secret = [0u8; 16];
    ctx.fill(&mut secret);
    let uuid = Uuid::new_v4();

    let to_device = Queue::default();
    let to_client = Queue::default();
    let commands = Rc::new(RefCell::new(Vec::new()));

    let mut device = SesameServerCore::new(Peripheral(Rc::clone(&to_client)), 1)?;
    device.begin(model, uuid);
    device.set_registered(&secret);
    let unix_secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as u32);
    device.set_current_time(unix_secs, 0);
    device.set_mech_setting(MechSetting5 {
        lock_position: LOCK_POSITION,
        unlock_position: UNLOCK_POSITION,
        auto_lock_sec: 0,
    });
    device.set_mech_status(MechStatus5 {
        battery: 3000,
        in_lock: true,
        is_stop: true,
        ..Default::default()
    });
    let sink = Rc::clone(&commands);
    device.set_command_callback(move |session, item, tag, trigger| {
        println!("🔒 device: session {session} {item:?} tag={tag:?} trigger={trigger:?}");
        sink.borrow_mut().push(item);
        ResultCode::Success
    });

    let adv = device.create_advertisement_data_os3()?;
    println!("📡 {model} {uuid}");
    println!("   manufacturer: {}", hex::encode(&adv.manufacturer_data));
    println!("   name: {}", adv.local_name);
    println!("   secret: {}", hex::encode(secret));

    let mut client = SesameClientCore::new(Central(Rc::clone(&to_device)))?;
    client.begin(model)?;
    client.set_keys(None, &secret)?;
    client.set_state_callback(|state| println!("📱 client: state {state:?}"));
    client.set_status_callback(|status| {
        println!(
            "📱 client: in_lock={} position={} battery={:.0}%",
            status.in_lock, status.position, status.battery_pct
        );
    });

    let mut sim = Simulation {
        client,
        device,
        to_device,
        to_client,
        commands,
    };

    sim.device.on_subscribed(SESSION, 0)?;
    sim.pump();
    if sim.client.state() != ClientState::Active {
        bail!("login did not complete, client is {:?}", sim.client.state());
    }

    sim.client.unlock(tag)?;
    sim.pump();
    sim.actuate()?;

    sim.client.lock(tag)?;
    sim.pump();
    sim.actuate()?;

    sim.client.disconnect();
    sim.device.on_disconnected(SESSION);
    println!("✅ 模拟结束");
    Ok(())
}
