//! 集成测试 - 客户端与服务端互通
//!
//! 通过内存中的双向队列连接 `SesameClientCore` 与 `SesameServerCore`，
//! 验证注册、登录、命令往返以及 IV 同步。

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use p256::SecretKey;
use rand::SeedableRng;
use rand::rngs::StdRng;

use sesame_core::crypto::ecc::{ecdh, public_key_to_binary};
use sesame_core::crypto::{CryptSession, Ecc, Role, aes_cmac};
use sesame_core::protocol::MechStatus;
use sesame_core::transport::{PacketKind, fragment_header};
use sesame_core::{
    ClientState, CryptoContext, DecodeResult, History, HistoryType, ItemCode, MechSetting5,
    MechStatus5, Model, OpCode, OsVersion, ResultCode, ServerBleBackend, SesameBleBackend,
    SesameClientCore, SesameServerCore, SessionState, Setting, Status, Transport, TriggerType,
};

type Wire = Rc<RefCell<VecDeque<Vec<u8>>>>;

struct ClientLink {
    to_server: Wire,
    disconnects: Rc<Cell<usize>>,
}

impl SesameBleBackend for ClientLink {
    fn write_to_tx(&mut self, data: &[u8]) -> bool {
        self.to_server.borrow_mut().push_back(data.to_vec());
        true
    }

    fn disconnect(&mut self) {
        self.disconnects.set(self.disconnects.get() + 1);
    }
}

/// 单一 central 的服务端链路
struct ServerLink {
    to_client: Wire,
    disconnected: Rc<RefCell<Vec<u16>>>,
}

impl ServerBleBackend for ServerLink {
    fn write_to_central(&mut self, _session_id: u16, data: &[u8]) -> bool {
        self.to_client.borrow_mut().push_back(data.to_vec());
        true
    }

    fn disconnect(&mut self, session_id: u16) {
        self.disconnected.borrow_mut().push(session_id);
    }
}

const SESSION: u16 = 1;
const DEVICE_UUID: uuid::Uuid = uuid::Uuid::from_u128(0x7a1c_90e2_4f3b_4c6d_8e5f_a0b1_c2d3_e4f5);

struct Loopback {
    client: SesameClientCore<ClientLink>,
    server: SesameServerCore<ServerLink>,
    to_server: Wire,
    to_client: Wire,
    client_disconnects: Rc<Cell<usize>>,
    server_disconnected: Rc<RefCell<Vec<u16>>>,
}

impl Loopback {
    fn new(model: Model) -> Self {
        let to_server = Wire::default();
        let to_client = Wire::default();
        let client_disconnects = Rc::new(Cell::new(0));
        let server_disconnected = Rc::new(RefCell::new(Vec::new()));
        let mut client = SesameClientCore::with_context(
            ClientLink {
                to_server: Rc::clone(&to_server),
                disconnects: Rc::clone(&client_disconnects),
            },
            CryptoContext::from_seed(101),
        );
        client.begin(model).unwrap();
        let mut server = SesameServerCore::with_context(
            ServerLink {
                to_client: Rc::clone(&to_client),
                disconnected: Rc::clone(&server_disconnected),
            },
            3,
            CryptoContext::from_seed(202),
        );
        server.begin(model, DEVICE_UUID);
        Self {
            client,
            server,
            to_server,
            to_client,
            client_disconnects,
            server_disconnected,
        }
    }

    /// 在两端之间搬运分片直到双方都安静
    fn pump(&mut self) {
        loop {
            let c2s = self.to_server.borrow_mut().pop_front();
            if let Some(f) = &c2s {
                if let Err(e) = self.server.on_received(SESSION, f) {
                    log::debug!("server rejected fragment: {e}");
                }
            }
            let s2c = self.to_client.borrow_mut().pop_front();
            if let Some(f) = &s2c {
                self.client.on_received(f);
            }
            if c2s.is_none() && s2c.is_none() {
                break;
            }
        }
    }

    fn connect(&mut self, now_ms: u32) {
        self.server.on_subscribed(SESSION, now_ms).unwrap();
        self.pump();
    }
}

fn active_loopback(model: Model, secret: &[u8; 16]) -> Loopback {
    let mut lb = Loopback::new(model);
    lb.server.set_registered(secret);
    lb.client.set_keys(None, secret).unwrap();
    lb.connect(0);
    assert_eq!(lb.client.state(), ClientState::Active);
    lb
}

/// 注册后客户端使用得到的 secret 登录，并完成一次命令往返
#[test]
fn test_registration_then_login_and_command() {
    let mut lb = Loopback::new(Model::Sesame5);
    let registered = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&registered);
    lb.server
        .set_registration_callback(move |_, secret| *sink.borrow_mut() = Some(*secret));
    lb.server.set_mech_status(MechStatus5 {
        battery: 3000,
        in_lock: true,
        ..Default::default()
    });
    lb.server.set_mech_setting(MechSetting5 {
        lock_position: 120,
        unlock_position: -40,
        auto_lock_sec: 15,
    });

    // 1. 以裸传输层完成注册
    lb.server.on_subscribed(SESSION, 0).unwrap();
    let initial = lb.to_client.borrow_mut().pop_front().unwrap();
    assert_eq!(initial[0], fragment_header(true, PacketKind::Plain));
    let phone_sk = SecretKey::random(&mut StdRng::seed_from_u64(5));
    let mut request = vec![ItemCode::Registration as u8];
    request.extend_from_slice(&public_key_to_binary(&phone_sk.public_key()));
    request.extend_from_slice(&0u32.to_le_bytes());
    let mut scratch = CryptSession::new(OsVersion::Os3, Role::Central);
    Transport::send_message(&[], &request, false, &mut scratch, &mut |f: &[u8]| {
        lb.server.on_received(SESSION, f).is_ok()
    })
    .unwrap();

    let mut transport = Transport::new();
    let mut response = Vec::new();
    while let Some(f) = lb.to_client.borrow_mut().pop_front() {
        if transport.decode(&f, &mut scratch) == DecodeResult::Received {
            response = transport.data().to_vec();
        }
    }
    assert_eq!(&response[..3], &[OpCode::Response as u8, ItemCode::Registration as u8, 0]);
    let device_pk: [u8; 64] = response[16..80].try_into().unwrap();
    let shared = ecdh(&phone_sk, &device_pk).unwrap();
    let secret: [u8; 16] = shared[..16].try_into().unwrap();
    assert_eq!(*registered.borrow(), Some(secret));
    assert!(lb.server.is_registered());
    lb.server.on_disconnected(SESSION);

    // 2. 客户端登录
    let states = Rc::new(RefCell::new(Vec::new()));
    let state_sink = Rc::clone(&states);
    lb.client.set_state_callback(move |s| state_sink.borrow_mut().push(s));
    let statuses = Rc::new(RefCell::new(Vec::<Status>::new()));
    let status_sink = Rc::clone(&statuses);
    lb.client
        .set_status_callback(move |s| status_sink.borrow_mut().push(*s));
    lb.client.set_keys(None, &secret).unwrap();
    lb.connect(100);

    assert_eq!(
        *states.borrow(),
        vec![ClientState::Authenticating, ClientState::Active]
    );
    assert_eq!(lb.server.session_state(SESSION), Some(SessionState::Running));
    assert!(statuses.borrow()[0].in_lock);
    assert!((lb.client.status().voltage - 6.0).abs() < 0.01);
    match lb.client.setting() {
        Some(Setting::Lock(l)) => {
            assert_eq!(l.lock_position, 120);
            assert_eq!(l.auto_lock_sec, 15);
        }
        other => panic!("unexpected setting {other:?}"),
    }

    // 3. 命令往返
    let commands = Rc::new(RefCell::new(Vec::new()));
    let cmd_sink = Rc::clone(&commands);
    lb.server.set_command_callback(move |_, item, tag, trigger| {
        cmd_sink.borrow_mut().push((item, tag.to_string(), trigger));
        ResultCode::Success
    });
    lb.client.unlock("front door").unwrap();
    lb.pump();
    lb.client.lock("").unwrap();
    lb.pump();
    lb.client
        .unlock_with_trigger(TriggerType::Remote, &[0x5a; 16])
        .unwrap();
    lb.pump();
    assert_eq!(
        *commands.borrow(),
        vec![
            (ItemCode::Unlock, "front door".to_string(), None),
            (ItemCode::Lock, String::new(), None),
            (ItemCode::Unlock, "5a".repeat(16), Some(TriggerType::Remote)),
        ]
    );
    // 双方 IV 保持一致，会话仍然有效
    assert_eq!(lb.client.state(), ClientState::Active);
    assert_eq!(lb.client_disconnects.get(), 0);
}

/// 未登录的 central 超时后被断开，客户端随后回到 idle
#[test]
fn test_login_timeout_then_client_idle() {
    let mut lb = Loopback::new(Model::Sesame5);
    lb.server.set_registered(&[1; 16]);
    lb.server.on_subscribed(SESSION, 1_000).unwrap();
    // 客户端没有密钥，不会登录
    lb.pump();
    assert_eq!(lb.client.state(), ClientState::Idle);
    assert_eq!(lb.client_disconnects.get(), 1);

    lb.server.update(10_999);
    assert!(lb.server_disconnected.borrow().is_empty());
    lb.server.update(11_001);
    assert_eq!(*lb.server_disconnected.borrow(), vec![SESSION]);
    lb.server.on_disconnected(SESSION);
    lb.client.on_disconnected();
    assert_eq!(lb.client.state(), ClientState::Idle);
    assert_eq!(lb.server.session_count(), 0);
}

/// 错误的 secret: 服务端认证失败并断开
#[test]
fn test_wrong_secret_is_rejected() {
    let mut lb = Loopback::new(Model::Sesame5);
    lb.server.set_registered(&[1; 16]);
    lb.client.set_keys(None, &[2; 16]).unwrap();
    lb.connect(0);
    assert_eq!(lb.client.state(), ClientState::Authenticating);
    assert_eq!(*lb.server_disconnected.borrow(), vec![SESSION]);
    assert_eq!(lb.server.session_state(SESSION), Some(SessionState::Idle));
    lb.client.on_disconnected();
    assert_eq!(lb.client.state(), ClientState::Idle);
}

/// OS3 客户端收到 token 00010203 后发送的登录报文
#[test]
fn test_os3_login_payload() {
    let written = Wire::default();
    let mut client = SesameClientCore::with_context(
        ClientLink {
            to_server: Rc::clone(&written),
            disconnects: Rc::new(Cell::new(0)),
        },
        CryptoContext::from_seed(1),
    );
    client.begin(Model::Sesame5Pro).unwrap();
    client.set_keys(None, &[0; 16]).unwrap();
    client.on_received(&[0x03, 8, 14, 0x00, 0x01, 0x02, 0x03]);

    let code = aes_cmac(&[0; 16], &[[0x00u8, 0x01, 0x02, 0x03].as_slice()]).unwrap();
    let frames = written.borrow();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0][0], 0x03);
    assert_eq!(frames[0][1], ItemCode::Login as u8);
    assert_eq!(&frames[0][2..], &code[..4]);
    assert_eq!(client.state(), ClientState::Authenticating);
}

/// 40 字节的标签在 OS3 上被截断为 29 字节
#[test]
fn test_long_tag_truncated() {
    let mut lb = active_loopback(Model::Sesame5, &[9; 16]);
    let tags = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&tags);
    lb.server.set_command_callback(move |_, _, tag, _| {
        sink.borrow_mut().push(tag.to_string());
        ResultCode::Success
    });
    lb.client.unlock(&"t".repeat(40)).unwrap();
    lb.pump();
    lb.client.unlock(&"é".repeat(20)).unwrap();
    lb.pump();
    let tags = tags.borrow();
    assert_eq!(tags[0], "t".repeat(29));
    // 2 字节字符: 14 个 = 28 字节
    assert_eq!(tags[1], "é".repeat(14));
}

/// 服务端推送的状态与历史记录到达客户端回调
#[test]
fn test_notify_status_and_history() {
    let mut lb = active_loopback(Model::Sesame5, &[3; 16]);
    let histories = Rc::new(RefCell::new(Vec::<History>::new()));
    let sink = Rc::clone(&histories);
    lb.client.set_history_callback(move |h| sink.borrow_mut().push(h.clone()));

    let status = MechStatus5 {
        battery: 2500,
        position: 77,
        in_lock: false,
        is_unlock_range: true,
        ..Default::default()
    };
    lb.server
        .send_notify(None, OpCode::Publish, ItemCode::MechStatus, &status.to_bytes())
        .unwrap();
    lb.pump();
    assert_eq!(lb.client.status().position, 77);
    assert!(lb.client.status().in_unlock);

    let mut body = vec![0];
    body.extend_from_slice(&42i32.to_le_bytes());
    body.push(HistoryType::BleUnlock as u8);
    body.extend_from_slice(&1_700_000_000u32.to_le_bytes());
    body.extend_from_slice(&status.to_bytes());
    body.push(4);
    body.extend_from_slice(b"home");
    lb.server
        .send_notify(Some(SESSION), OpCode::Response, ItemCode::History, &body)
        .unwrap();
    lb.pump();

    // 结构化标签与带尾随字节的空标签
    let mut trigger_body = body[..17].to_vec();
    trigger_body.extend_from_slice(&[0, TriggerType::FaceFinger as u8]);
    trigger_body.extend_from_slice(&[0x0f; 16]);
    lb.server
        .send_notify(Some(SESSION), OpCode::Response, ItemCode::History, &trigger_body)
        .unwrap();
    let mut padded_body = body[..17].to_vec();
    padded_body.extend_from_slice(&[0; 22]);
    lb.server
        .send_notify(Some(SESSION), OpCode::Response, ItemCode::History, &padded_body)
        .unwrap();
    lb.pump();

    let histories = histories.borrow();
    assert_eq!(histories.len(), 3);
    assert_eq!(histories[0].record_id, 42);
    assert_eq!(histories[0].history_type, HistoryType::BleUnlock);
    assert_eq!(histories[0].time, 1_700_000_000);
    assert_eq!(histories[0].tag, "home");
    assert_eq!(histories[1].trigger_type, Some(TriggerType::FaceFinger));
    assert_eq!(histories[1].tag, "0f".repeat(16));
    assert!(histories[2].tag.is_empty());
    assert_eq!(histories[2].trigger_type, None);
    assert_eq!(lb.client.state(), ClientState::Active);
}

/// 跳过的消息仍推进解密 IV
#[test]
fn test_iv_lockstep_under_skipped_messages() {
    let key = [0x24; 16];
    let (c_tok, p_tok) = ([0; 4], [4, 3, 2, 1]);
    let mut central = CryptSession::new(OsVersion::Os3, Role::Central);
    let mut peripheral = CryptSession::new(OsVersion::Os3, Role::Peripheral);
    central.set_session_key(&key, &c_tok, &p_tok).unwrap();
    peripheral.set_session_key(&key, &p_tok, &c_tok).unwrap();

    let mut frames = Vec::new();
    let mut sink = |f: &[u8]| {
        frames.push(f.to_vec());
        true
    };
    // 超长消息 (接收端溢出) + 正常消息
    Transport::send_message(&[], &[0xee; 140], true, &mut peripheral, &mut sink).unwrap();
    Transport::send_message(&[], b"after overflow", true, &mut peripheral, &mut sink).unwrap();

    let mut transport = Transport::new();
    let results: Vec<DecodeResult> = frames
        .iter()
        .map(|f| transport.decode(f, &mut central))
        .collect();
    assert_eq!(*results.last().unwrap(), DecodeResult::Received);
    assert_eq!(transport.data(), b"after overflow");
    assert!(results.contains(&DecodeResult::Skipping));
    assert_eq!(central.counters().1, peripheral.counters().1);

    // 消息结束后的孤立加密分片: 不产出明文，计数器前进 1
    let before = central.counters().1;
    let stray = [fragment_header(false, PacketKind::Encrypted), 1, 2, 3];
    assert_eq!(transport.decode(&stray, &mut central), DecodeResult::Skipping);
    assert_eq!(central.counters().1, before + 1);
}

/// 只有可控制的锁、Bot 与遥控类型号能够 begin
#[test]
fn test_begin_model_selection() {
    for model in Model::ALL {
        let mut client = SesameClientCore::with_context(
            ClientLink {
                to_server: Wire::default(),
                disconnects: Rc::new(Cell::new(0)),
            },
            CryptoContext::from_seed(0),
        );
        let expected = !matches!(
            model,
            Model::Wifi2
                | Model::Hub3
                | Model::BleConnector
                | Model::Sesame5Us
                | Model::Sesame6
                | Model::Sesame6Pro
        );
        assert_eq!(client.begin(model).is_ok(), expected, "{model}");
    }
}

/// OS2 客户端与模拟设备完成 ECDH 登录
#[test]
fn test_os2_login_with_simulated_device() {
    let mut ctx = CryptoContext::from_seed(77);
    let mut device = Ecc::default();
    device.generate_keypair(&mut ctx);
    let device_pk = device.export_pk().unwrap();
    let secret = [0x42; 16];

    let written = Wire::default();
    let mut client = SesameClientCore::with_context(
        ClientLink {
            to_server: Rc::clone(&written),
            disconnects: Rc::new(Cell::new(0)),
        },
        CryptoContext::from_seed(78),
    );
    client.begin(Model::Sesame4).unwrap();
    client.set_keys(Some(&device_pk), &secret).unwrap();

    let token = [0x10, 0x20, 0x30, 0x40];
    let mut initial = vec![0x03, OpCode::Publish as u8, ItemCode::Initial as u8];
    initial.extend_from_slice(&token);
    client.on_received(&initial);
    assert_eq!(client.state(), ClientState::Authenticating);

    // 设备端解析 sync/login
    let mut transport = Transport::new();
    let mut unused = CryptSession::new(OsVersion::Os2, Role::Peripheral);
    let mut login = Vec::new();
    for f in written.borrow_mut().drain(..) {
        if transport.decode(&f, &mut unused) == DecodeResult::Received {
            login = transport.data().to_vec();
        }
    }
    assert_eq!(&login[..2], &[OpCode::Sync as u8, ItemCode::Login as u8]);
    assert_eq!(login.len(), 2 + 2 + 64 + 4 + 4);
    let phone_pk: [u8; 64] = login[4..68].try_into().unwrap();
    let local_tok: [u8; 4] = login[68..72].try_into().unwrap();
    let expected_tag = aes_cmac(&secret, &[&login[2..72], token.as_slice()]).unwrap();
    assert_eq!(&login[72..], &expected_tag[..4]);

    let shared = device.ecdh(&phone_pk).unwrap();
    let ssec: [u8; 16] = shared[..16].try_into().unwrap();
    let session_key = aes_cmac(&ssec, &[local_tok.as_slice(), token.as_slice()]).unwrap();
    let mut device_crypt = CryptSession::new(OsVersion::Os2, Role::Peripheral);
    device_crypt
        .set_session_key(&session_key, &token, &local_tok)
        .unwrap();

    // 加密的 response/login: 头 10 字节 + 设定 12 + 状态 8
    let mut body = vec![OpCode::Sync as u8, ResultCode::Success as u8];
    body.extend_from_slice(&1_600_000_000u32.to_le_bytes());
    body.extend_from_slice(&[0; 4]);
    let mut setting = [0u8; 12];
    setting[..2].copy_from_slice(&300i16.to_le_bytes());
    setting[2..4].copy_from_slice(&(-300i16).to_le_bytes());
    body.extend_from_slice(&setting);
    let mut status = [0u8; 8];
    status[..2].copy_from_slice(&800u16.to_le_bytes());
    status[7] = 0b0000_0010;
    body.extend_from_slice(&status);
    assert!(MechStatus::parse(&status).unwrap().in_lock());

    let mut frames = Vec::new();
    Transport::send_message(
        &[OpCode::Response as u8, ItemCode::Login as u8],
        &body,
        true,
        &mut device_crypt,
        &mut |f: &[u8]| {
            frames.push(f.to_vec());
            true
        },
    )
    .unwrap();
    for f in &frames {
        client.on_received(f);
    }
    assert_eq!(client.state(), ClientState::Active);
    assert!(client.status().in_lock);
    assert!(matches!(client.setting(), Some(Setting::Lock(l)) if l.lock_position == 300 && l.auto_lock_sec == -1));

    // 之后的命令由设备端解密
    client.lock("os2").unwrap();
    let mut transport = Transport::new();
    let mut cmd = Vec::new();
    for f in written.borrow_mut().drain(..) {
        if transport.decode(&f, &mut device_crypt) == DecodeResult::Received {
            cmd = transport.data().to_vec();
        }
    }
    assert_eq!(&cmd[..2], &[OpCode::Async as u8, ItemCode::Lock as u8]);
    assert_eq!(cmd.len(), 2 + 22);
    assert_eq!(&cmd[2..6], &[3, b'o', b's', b'2']);

    // 空标签的历史记录: 22 字节全零的标签字段
    let histories = Rc::new(RefCell::new(Vec::<History>::new()));
    let sink = Rc::clone(&histories);
    client.set_history_callback(move |h| sink.borrow_mut().push(h.clone()));
    let mut body = vec![OpCode::Read as u8, ResultCode::Success as u8];
    body.extend_from_slice(&9i32.to_le_bytes());
    body.push(HistoryType::ManualLocked as u8);
    body.extend_from_slice(&1_600_000_000_000i64.to_le_bytes());
    body.extend_from_slice(&[0; 18]);
    body.extend_from_slice(&[0; 22]);
    let mut frames = Vec::new();
    Transport::send_message(
        &[OpCode::Response as u8, ItemCode::History as u8],
        &body,
        true,
        &mut device_crypt,
        &mut |f: &[u8]| {
            frames.push(f.to_vec());
            true
        },
    )
    .unwrap();
    for f in &frames {
        client.on_received(f);
    }
    let histories = histories.borrow();
    assert_eq!(histories.len(), 1);
    assert_eq!(histories[0].record_id, 9);
    assert_eq!(histories[0].history_type, HistoryType::ManualLocked);
    assert_eq!(histories[0].time, 1_600_000_000);
    assert!(histories[0].tag.is_empty());
    assert_eq!(histories[0].trigger_type, None);
    assert_eq!(client.state(), ClientState::Active);
}
