//! Simulated shield for tests.
//!
//! Implements [`Spi`] by decoding request words the way the shield firmware
//! does, for either protocol generation, and answers commands from a small
//! model of sockets, DNS, addresses, RTC, SMTP and log buffers. Tests keep a
//! [`SimHandle`] to inject peer data, script replies and inspect traffic
//! after the [`SimShield`] itself has been moved into a driver.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::hw_trait::{Result, Spi};
use crate::protocol::Generation;
use crate::transport::{ApiHeader, FrameKind};

const SOCKETS: usize = 6;

/// Scripted or computed reply to one command.
#[derive(Debug, Clone)]
pub(crate) enum SimReply {
    Int(u64),
    Data(Vec<u8>),
    Empty,
    Error(u16, &'static str),
    /// First generation only: NAK `Wnnn`, then `then` becomes readable
    /// after `ready_after`.
    Wait {
        seconds: u16,
        ready_after: Duration,
        then: Box<SimReply>,
    },
    /// NAK with an arbitrary payload.
    RawNak(Vec<u8>),
    /// Second generation only: `-EAGAIN`.
    Again,
    /// No reply at all.
    Silent,
}

#[derive(Debug, Default)]
struct SimSocket {
    state: u16,
    rx: VecDeque<u8>,
    sent: Vec<u8>,
    plan: VecDeque<u16>,
    connect_plan: Option<Vec<u16>>,
    close_plan: Option<Vec<u16>>,
    unsent: u32,
    settings: Vec<String>,
}

impl SimSocket {
    fn poll_state(&mut self) -> u16 {
        if let Some(next) = self.plan.pop_front() {
            self.state = next;
        }
        self.state
    }
}

pub(crate) struct SimState {
    generation: Generation,
    attached: bool,
    synced: bool,

    transfers: usize,
    reset_words: usize,
    magic_words: usize,

    // shield to host
    tx_cmd: VecDeque<u8>,
    tx_data: VecDeque<u8>,
    delayed: Vec<(Instant, Vec<u8>)>,

    // host to shield
    rx_frame: Vec<u8>,
    rx_data: Vec<Vec<u8>>,
    data_target: Option<String>,

    commands: Vec<String>,
    data_log: Vec<(String, Vec<u8>)>,
    script: VecDeque<(String, SimReply)>,

    sockets: [SimSocket; SOCKETS],
    values: HashMap<String, SimReply>,
    dns: HashMap<String, String>,
    logs: HashMap<u8, VecDeque<u8>>,
    smtp_status: Option<String>,
    ssh_credentials: (String, String),
}

impl SimState {
    fn new(generation: Generation) -> Self {
        let mut values = HashMap::new();
        let strings = [
            ("get ipaddr", "192.168.0.10"),
            ("get netmask", "255.255.255.0"),
            ("get gwaddr", "192.168.0.1"),
            ("get nsaddr", "8.8.8.8"),
            ("get ipaddr6 0", "fe80::1"),
            ("get ipaddr6 1", "2001:db8::10"),
            ("get gwaddr6", "fe80::fe"),
            ("get nsaddr6", "2001:4860:4860::8888"),
        ];
        for dev in ["net0", "net"] {
            for (key, value) in strings {
                values.insert(format!("{} {}", dev, key), SimReply::Data(value.as_bytes().to_vec()));
            }
            values.insert(format!("{} get prefix6", dev), SimReply::Int(64));
        }
        values.insert("net1 get mode".into(), SimReply::Data(Vec::new()));
        values.insert("net0 get mode".into(), SimReply::Data(b"100BASE-TX/full".to_vec()));
        values.insert("net0 get speed".into(), SimReply::Int(100));
        values.insert("net1 get speed".into(), SimReply::Int(54));
        values.insert("sys pkg ver".into(), SimReply::Int(10203));
        values.insert("sys date".into(), SimReply::Data(b"20261016093000".to_vec()));
        for (key, value) in [
            ("hour", 9),
            ("minute", 30),
            ("second", 0),
            ("day", 16),
            ("wday", 5),
            ("month", 10),
            ("year", 2026),
        ] {
            values.insert(format!("sys rtc get {}", key), SimReply::Int(value));
        }

        let mut dns = HashMap::new();
        dns.insert("example.com".to_string(), "93.184.216.34".to_string());

        Self {
            generation,
            attached: true,
            synced: false,
            transfers: 0,
            reset_words: 0,
            magic_words: 0,
            tx_cmd: VecDeque::new(),
            tx_data: VecDeque::new(),
            delayed: Vec::new(),
            rx_frame: Vec::new(),
            rx_data: Vec::new(),
            data_target: None,
            commands: Vec::new(),
            data_log: Vec::new(),
            script: VecDeque::new(),
            sockets: Default::default(),
            values,
            dns,
            logs: HashMap::new(),
            smtp_status: None,
            ssh_credentials: ("admin".into(), "secret".into()),
        }
    }

    fn transfer(&mut self, write: &[u8], read: &mut [u8]) {
        self.transfers += 1;
        read.fill(0);
        let now = Instant::now();
        let (ready, waiting): (Vec<_>, Vec<_>) = self.delayed.drain(..).partition(|(at, _)| *at <= now);
        self.delayed = waiting;
        for (_, bytes) in ready {
            self.tx_cmd.extend(bytes);
        }

        if !self.attached || write.len() < 4 {
            return;
        }
        let word = u16::from_be_bytes([write[0], write[1]]);
        let payload = &write[4..];
        let reply = match self.generation {
            Generation::V1 => self.v1_word(word, payload, &mut read[4..]),
            Generation::V2 => self.v2_word(word, payload, &mut read[4..]),
        };
        read[2..4].copy_from_slice(&reply.to_be_bytes());
    }

    fn v1_status(&self) -> u16 {
        let mut status = 0x8000 | 0x2000;
        if !self.tx_cmd.is_empty() {
            status |= 0x1000;
        }
        status
    }

    fn v1_word(&mut self, word: u16, payload: &[u8], out: &mut [u8]) -> u16 {
        match word {
            0x5a3c => {
                self.magic_words += 1;
                self.synced = true;
                return self.v1_status();
            }
            0xf000 => {
                self.reset_words += 1;
                self.synced = false;
                self.rx_frame.clear();
                return 0;
            }
            _ if !self.synced => return 0,
            _ => {}
        }
        let len = (word & 0x0fff) as usize;
        match word & 0xf000 {
            0x0000 => self.v1_status(),
            0x1000 => self.tx_cmd.len().min(0x0fff) as u16,
            0x2000 => 0x0800,
            0x3000 => {
                for b in out.iter_mut().take(len) {
                    *b = self.tx_cmd.pop_front().unwrap_or(0);
                }
                self.v1_status()
            }
            0x4000 => {
                self.rx_frame.extend_from_slice(&payload[..len.min(payload.len())]);
                self.v1_frames();
                self.v1_status()
            }
            _ => 0,
        }
    }

    fn v1_frames(&mut self) {
        while self.rx_frame.len() >= 4 {
            let header = ApiHeader::decode([self.rx_frame[0], self.rx_frame[1], self.rx_frame[2], self.rx_frame[3]]);
            if self.rx_frame.len() < 4 + header.length {
                return;
            }
            let body: Vec<u8> = self.rx_frame.drain(..4 + header.length).skip(4).collect();
            match header.kind {
                FrameKind::Command => {
                    let text = String::from_utf8_lossy(&body).into_owned();
                    self.data_target = Some(text.clone());
                    let reply = self.handle(&text);
                    self.v1_reply(reply);
                }
                FrameKind::Data => {
                    let target = self.data_target.clone().unwrap_or_default();
                    self.accept_data(&target, body);
                }
            }
        }
    }

    fn v1_encode(kind_nak: bool, payload: &[u8]) -> Vec<u8> {
        let mut header = ApiHeader::new(FrameKind::Data, payload.len());
        header.nak = kind_nak;
        let mut bytes = header.encode().to_vec();
        bytes.extend_from_slice(payload);
        bytes
    }

    fn v1_reply_bytes(reply: &SimReply) -> Option<Vec<u8>> {
        match reply {
            SimReply::Int(v) => Some(Self::v1_encode(false, v.to_string().as_bytes())),
            SimReply::Data(d) => Some(Self::v1_encode(false, d)),
            SimReply::Empty | SimReply::Again => Some(Self::v1_encode(false, &[])),
            SimReply::Error(code, msg) => {
                Some(Self::v1_encode(true, format!("E{:03} {}", code, msg).as_bytes()))
            }
            SimReply::RawNak(bytes) => Some(Self::v1_encode(true, bytes)),
            SimReply::Wait { seconds, .. } => {
                Some(Self::v1_encode(true, format!("W{:03}", seconds).as_bytes()))
            }
            SimReply::Silent => None,
        }
    }

    fn v1_reply(&mut self, reply: SimReply) {
        if let Some(bytes) = Self::v1_reply_bytes(&reply) {
            self.tx_cmd.extend(bytes);
        }
        if let SimReply::Wait { ready_after, then, .. } = reply {
            if let Some(bytes) = Self::v1_reply_bytes(&then) {
                self.delayed.push((Instant::now() + ready_after, bytes));
            }
        }
    }

    fn v2_word(&mut self, word: u16, payload: &[u8], out: &mut [u8]) -> u16 {
        match word {
            0xa5c3 => {
                self.magic_words += 1;
                self.synced = true;
                let mut status = 0x823c;
                if !self.tx_cmd.is_empty() || !self.tx_data.is_empty() {
                    status |= 0x2000;
                }
                return status;
            }
            0xe000 => {
                self.reset_words += 1;
                self.synced = false;
                return 0;
            }
            _ if !self.synced => return 0,
            _ => {}
        }
        let data = word & 0x0800 != 0;
        let len = (word & 0x07ff) as usize;
        match word & 0xe000 {
            0x0000 => 0x823c,
            0x2000 => {
                let n = if data { self.tx_data.len() } else { self.tx_cmd.len() };
                n.min(0x07ff) as u16
            }
            0x4000 => 0x07ff,
            0x6000 => {
                let source = if data { &mut self.tx_data } else { &mut self.tx_cmd };
                for b in out.iter_mut().take(len) {
                    *b = source.pop_front().unwrap_or(0);
                }
                0x823c
            }
            0x8000 => {
                let body = payload[..len.min(payload.len())].to_vec();
                if data {
                    self.rx_data.push(body);
                } else {
                    let text = String::from_utf8_lossy(&body).into_owned();
                    let frames = std::mem::take(&mut self.rx_data);
                    for frame in &frames {
                        self.accept_data(&text, frame.clone());
                    }
                    let total: usize = frames.iter().map(Vec::len).sum();
                    let reply = self.handle(&text);
                    let reply = match reply {
                        SimReply::Empty if total > 0 && text.ends_with("send") => SimReply::Int(total as u64),
                        other => other,
                    };
                    self.v2_reply(reply);
                }
                0x823c
            }
            _ => 0,
        }
    }

    fn v2_reply(&mut self, reply: SimReply) {
        let value: i64 = match reply {
            SimReply::Int(v) => v as i64,
            SimReply::Data(d) => {
                let len = d.len() as i64;
                self.tx_data.extend(d);
                len
            }
            SimReply::Empty => 0,
            SimReply::Error(code, _) => -(code as i64),
            SimReply::RawNak(_) => -71,
            SimReply::Again => -11,
            SimReply::Wait { then, .. } => return self.v2_reply(*then),
            SimReply::Silent => return,
        };
        self.tx_cmd.extend(value.to_le_bytes());
    }

    fn accept_data(&mut self, command: &str, data: Vec<u8>) {
        let norm = command.replace(" ioctl ", " ");
        let words: Vec<&str> = norm.split_whitespace().collect();
        if let [dev, "send"] = words.as_slice() {
            if let Some(id) = socket_id(dev) {
                self.sockets[id].sent.extend_from_slice(&data);
            }
        }
        self.data_log.push((command.to_string(), data));
    }

    fn handle(&mut self, raw: &str) -> SimReply {
        self.commands.push(raw.to_string());
        if let Some(pos) = self.script.iter().position(|(prefix, _)| raw.starts_with(prefix.as_str())) {
            if let Some((_, reply)) = self.script.remove(pos) {
                return reply;
            }
        }

        let norm = raw.replace(" ioctl ", " ");
        let words: Vec<&str> = norm.split_whitespace().collect();

        if let Some(id) = words.first().and_then(|dev| socket_id(dev)) {
            return self.handle_socket(id, &words[1..]);
        }

        match words.as_slice() {
            ["dns", "query", _, host, _] => match self.dns.get(*host) {
                Some(ip) => SimReply::Data(ip.as_bytes().to_vec()),
                None => SimReply::Data(Vec::new()),
            },
            ["sys", "date", "format"] => SimReply::Empty,
            ["sys", log, "read", n] | [log, "read", n] if log.starts_with("log") => {
                let id: u8 = log[3..].parse().unwrap_or(0);
                let n: usize = n.parse().unwrap_or(0);
                let buf = self.logs.entry(id).or_default();
                let take = n.min(buf.len());
                SimReply::Data(buf.drain(..take).collect())
            }
            ["sys", log, "flush"] if log.starts_with("log") => {
                let id: u8 = log[3..].parse().unwrap_or(0);
                self.logs.remove(&id);
                SimReply::Empty
            }
            ["smtp", "send", ..] => {
                self.smtp_status = Some("250".into());
                SimReply::Empty
            }
            ["smtp", "status"] => match &self.smtp_status {
                Some(status) => SimReply::Data(status.as_bytes().to_vec()),
                None => SimReply::Data(Vec::new()),
            },
            ["smtp", ..] | ["php", "smtp", ..] => SimReply::Empty,
            _ => self
                .values
                .get(&norm)
                .cloned()
                .unwrap_or(SimReply::Error(22, "invalid argument")),
        }
    }

    fn handle_socket(&mut self, id: usize, args: &[&str]) -> SimReply {
        let ssh = &self.ssh_credentials;
        let sock = &mut self.sockets[id];
        match args {
            ["get", "state"] => SimReply::Int(sock.poll_state() as u64),
            ["get", "rxlen"] => SimReply::Int(sock.rx.len() as u64),
            ["get", "txlen"] => {
                let pending = sock.unsent;
                sock.unsent = sock.unsent.saturating_sub(1);
                SimReply::Int(pending as u64)
            }
            ["get", "ssh", "username"] => SimReply::Data(ssh.0.as_bytes().to_vec()),
            ["get", "ssh", "password"] => SimReply::Data(ssh.1.as_bytes().to_vec()),
            ["set", "ssh", "auth", verdict] => {
                sock.settings.push(format!("ssh auth {}", verdict));
                sock.state = if *verdict == "accept" { 19 } else { 0 };
                SimReply::Empty
            }
            ["set", rest @ ..] => {
                sock.settings.push(rest.join(" "));
                SimReply::Empty
            }
            ["connect", _, _] => {
                let default = if id == 0 { vec![2, 19] } else { vec![2, 4] };
                sock.plan = sock.connect_plan.clone().unwrap_or(default).into();
                SimReply::Empty
            }
            ["listen", _] => {
                sock.state = 1;
                sock.plan.clear();
                SimReply::Empty
            }
            ["close"] => {
                match &sock.close_plan {
                    Some(plan) => sock.plan = plan.clone().into(),
                    None => {
                        sock.plan.clear();
                        sock.state = 0;
                    }
                }
                SimReply::Empty
            }
            ["recv", n] => {
                let n: usize = n.parse().unwrap_or(0);
                let take = n.min(sock.rx.len());
                SimReply::Data(sock.rx.drain(..take).collect())
            }
            ["peek", n] => {
                let n: usize = n.parse().unwrap_or(0);
                SimReply::Data(sock.rx.iter().take(n).copied().collect())
            }
            ["send"] => SimReply::Empty,
            _ => SimReply::Error(22, "invalid argument"),
        }
    }
}

fn socket_id(dev: &str) -> Option<usize> {
    dev.strip_prefix("tcp")
        .and_then(|n| n.parse::<usize>().ok())
        .filter(|&n| n < SOCKETS)
}

/// The [`Spi`] end of the simulation.
pub(crate) struct SimShield {
    state: Arc<Mutex<SimState>>,
}

impl SimShield {
    pub(crate) fn v1() -> (Self, SimHandle) {
        Self::new(Generation::V1)
    }

    pub(crate) fn v2() -> (Self, SimHandle) {
        Self::new(Generation::V2)
    }

    pub(crate) fn new(generation: Generation) -> (Self, SimHandle) {
        let state = Arc::new(Mutex::new(SimState::new(generation)));
        (
            Self {
                state: Arc::clone(&state),
            },
            SimHandle { state },
        )
    }
}

#[async_trait]
impl Spi for SimShield {
    async fn transfer(&mut self, write: &[u8], read: &mut [u8]) -> Result<()> {
        self.state.lock().unwrap().transfer(write, read);
        Ok(())
    }
}

/// Test-side view of the simulation.
#[derive(Clone)]
pub(crate) struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

#[allow(dead_code)]
impl SimHandle {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn set_synced(&self, synced: bool) {
        self.lock().synced = synced;
    }

    /// Unplug the shield: every transfer reads back zeros.
    pub(crate) fn detach(&self) {
        self.lock().attached = false;
    }

    pub(crate) fn transfers(&self) -> usize {
        self.lock().transfers
    }

    pub(crate) fn reset_words(&self) -> usize {
        self.lock().reset_words
    }

    pub(crate) fn magic_words(&self) -> usize {
        self.lock().magic_words
    }

    /// Answer the next command starting with `prefix` with `reply`.
    pub(crate) fn script(&self, prefix: &str, reply: SimReply) {
        self.lock().script.push_back((prefix.to_string(), reply));
    }

    pub(crate) fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    pub(crate) fn clear_commands(&self) {
        self.lock().commands.clear();
    }

    pub(crate) fn count_commands(&self, prefix: &str) -> usize {
        self.lock()
            .commands
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    /// Data frames received with commands starting with `prefix`.
    pub(crate) fn data_for(&self, prefix: &str) -> Vec<Vec<u8>> {
        self.lock()
            .data_log
            .iter()
            .filter(|(c, _)| c.starts_with(prefix))
            .map(|(_, d)| d.clone())
            .collect()
    }

    /// Bytes the shield holds for the host.
    pub(crate) fn pending_tx(&self) -> usize {
        let state = self.lock();
        state.tx_cmd.len() + state.tx_data.len()
    }

    pub(crate) fn push_peer_data(&self, slot: usize, data: &[u8]) {
        self.lock().sockets[slot].rx.extend(data.iter().copied());
    }

    pub(crate) fn peer_pending(&self, slot: usize) -> usize {
        self.lock().sockets[slot].rx.len()
    }

    pub(crate) fn sent(&self, slot: usize) -> Vec<u8> {
        self.lock().sockets[slot].sent.clone()
    }

    pub(crate) fn set_state(&self, slot: usize, state: u16) {
        self.lock().sockets[slot].state = state;
    }

    pub(crate) fn state(&self, slot: usize) -> u16 {
        self.lock().sockets[slot].state
    }

    /// States reported by successive polls after `connect`.
    pub(crate) fn set_connect_plan(&self, slot: usize, plan: &[u16]) {
        self.lock().sockets[slot].connect_plan = Some(plan.to_vec());
    }

    /// States reported by successive polls after `close`.
    pub(crate) fn set_close_plan(&self, slot: usize, plan: &[u16]) {
        self.lock().sockets[slot].close_plan = Some(plan.to_vec());
    }

    /// Number of polls for which `get txlen` reports pending bytes.
    pub(crate) fn set_unsent(&self, slot: usize, polls: u32) {
        self.lock().sockets[slot].unsent = polls;
    }

    pub(crate) fn settings(&self, slot: usize) -> Vec<String> {
        self.lock().sockets[slot].settings.clone()
    }

    pub(crate) fn set_value(&self, command: &str, reply: SimReply) {
        self.lock().values.insert(command.to_string(), reply);
    }

    pub(crate) fn add_dns(&self, host: &str, ip: &str) {
        self.lock().dns.insert(host.to_string(), ip.to_string());
    }

    pub(crate) fn push_log(&self, id: u8, text: &[u8]) {
        self.lock().logs.entry(id).or_default().extend(text.iter().copied());
    }

    pub(crate) fn set_smtp_status(&self, status: &str) {
        self.lock().smtp_status = Some(status.to_string());
    }

    pub(crate) fn set_ssh_credentials(&self, user: &str, password: &str) {
        self.lock().ssh_credentials = (user.to_string(), password.to_string());
    }
}
