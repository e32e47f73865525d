#![cfg(target_os = "android")]

//! JNI exports of `dev.tunwall.TunwallService` and the host bridge backed by it.
//!
//! `jni_run` blocks on the calling Java thread. All host callbacks are made on
//! that same thread through its `JNIEnv`, each inside its own local frame so
//! references do not pile up over a long run.

use crate::api;
use crate::logging::android_log;
use jni::errors::Result as JniResult;
use jni::objects::{JObject, JString, JValue};
use jni::sys::{jboolean, jint, jintArray, jlong, JNI_FALSE, JNI_TRUE};
use jni::JNIEnv;
use std::net::{IpAddr, SocketAddr};
use std::os::unix::io::RawFd;
use tracing::{debug, error, info, warn};
use tunwall_core::{ConnectionRecord, DnsRecord, FlowKey, HostBridge, HostError, PacketRecord, UsageRecord, Verdict};

const FRAME_CAPACITY: i32 = 16;

/// Host bridge calling back into the VPN service object
pub struct JniHost<'a, 'local> {
    env: &'a mut JNIEnv<'local>,
    service: &'a JObject<'local>,
}

impl<'a, 'local> JniHost<'a, 'local> {
    pub fn new(env: &'a mut JNIEnv<'local>, service: &'a JObject<'local>) -> Self {
        Self { env, service }
    }

    /// Log a failed callback and clear any pending Java exception
    fn settle<T>(&mut self, method: &str, result: JniResult<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("{} failed: {}", method, e);
                if self.env.exception_check().unwrap_or(false) {
                    let _ = self.env.exception_describe();
                    let _ = self.env.exception_clear();
                }
                None
            }
        }
    }
}

fn read_string(env: &mut JNIEnv<'_>, value: JObject<'_>) -> JniResult<Option<String>> {
    if value.is_null() {
        return Ok(None);
    }
    let value = JString::from(value);
    let text: String = env.get_string(&value)?.into();
    Ok(Some(text))
}

impl HostBridge for JniHost<'_, '_> {
    fn decide(&mut self, key: &FlowKey, uid: i32) -> Result<Verdict, HostError> {
        let service = self.service;
        let result = self.env.with_local_frame(FRAME_CAPACITY, |env| -> JniResult<Verdict> {
            let saddr = env.new_string(key.src.ip().to_string())?;
            let daddr = env.new_string(key.dst.ip().to_string())?;
            let allowed = env
                .call_method(
                    service,
                    "isAddressAllowed",
                    "(IILjava/lang/String;ILjava/lang/String;II)Ldev/tunwall/Allowed;",
                    &[
                        JValue::Int(key.version() as jint),
                        JValue::Int(key.ip_protocol() as jint),
                        JValue::Object(&saddr),
                        JValue::Int(key.src.port() as jint),
                        JValue::Object(&daddr),
                        JValue::Int(key.dst.port() as jint),
                        JValue::Int(uid),
                    ],
                )?
                .l()?;
            if allowed.is_null() {
                return Ok(Verdict::Deny);
            }

            let raddr = env.get_field(&allowed, "raddr", "Ljava/lang/String;")?.l()?;
            let rport = env.get_field(&allowed, "rport", "I")?.i()?;
            let redirect = read_string(env, raddr)?
                .and_then(|text| text.parse::<IpAddr>().ok())
                .zip(u16::try_from(rport).ok().filter(|port| *port != 0))
                .map(|(ip, port)| SocketAddr::new(ip, port));
            Ok(Verdict::Allow { redirect })
        });

        match result {
            Ok(verdict) => Ok(verdict),
            Err(e) => {
                self.settle::<()>("isAddressAllowed", Err(e));
                Err(HostError::Call("isAddressAllowed".to_string()))
            }
        }
    }

    fn report_packet(&mut self, record: &PacketRecord) {
        let service = self.service;
        let result = self.env.with_local_frame(FRAME_CAPACITY, |env| -> JniResult<()> {
            let flags = env.new_string(&record.flags)?;
            let saddr = env.new_string(record.src.ip().to_string())?;
            let daddr = env.new_string(record.dst.ip().to_string())?;
            let data = env.new_string(&record.data)?;
            env.call_method(
                service,
                "logPacket",
                "(JIILjava/lang/String;Ljava/lang/String;ILjava/lang/String;ILjava/lang/String;IZ)V",
                &[
                    JValue::Long(record.time_ms),
                    JValue::Int(record.version as jint),
                    JValue::Int(record.protocol as jint),
                    JValue::Object(&flags),
                    JValue::Object(&saddr),
                    JValue::Int(record.src.port() as jint),
                    JValue::Object(&daddr),
                    JValue::Int(record.dst.port() as jint),
                    JValue::Object(&data),
                    JValue::Int(record.uid),
                    JValue::Bool(record.allowed as jboolean),
                ],
            )?;
            Ok(())
        });
        self.settle("logPacket", result);
    }

    fn report_connection(&mut self, record: &ConnectionRecord<'_>) {
        let service = self.service;
        let result = self.env.with_local_frame(FRAME_CAPACITY, |env| -> JniResult<()> {
            let daddr = env.new_string(record.dst.ip().to_string())?;
            env.call_method(
                service,
                "logConnection",
                "(JILjava/lang/String;II)V",
                &[
                    JValue::Long(record.time_ms),
                    JValue::Int(record.version as jint),
                    JValue::Object(&daddr),
                    JValue::Int(record.dst.port() as jint),
                    JValue::Int(record.uid),
                ],
            )?;
            Ok(())
        });
        self.settle("logConnection", result);
    }

    fn report_dns(&mut self, record: &DnsRecord) {
        let service = self.service;
        let result = self.env.with_local_frame(FRAME_CAPACITY, |env| -> JniResult<()> {
            let qname = env.new_string(&record.query_name)?;
            let aname = env.new_string(&record.answer_name)?;
            let resource = env.new_string(&record.resource)?;
            env.call_method(
                service,
                "dnsResolved",
                "(JLjava/lang/String;Ljava/lang/String;Ljava/lang/String;I)V",
                &[
                    JValue::Long(record.time_ms),
                    JValue::Object(&qname),
                    JValue::Object(&aname),
                    JValue::Object(&resource),
                    JValue::Int(record.ttl as jint),
                ],
            )?;
            Ok(())
        });
        self.settle("dnsResolved", result);
    }

    fn report_usage(&mut self, record: &UsageRecord) {
        let service = self.service;
        let result = self.env.with_local_frame(FRAME_CAPACITY, |env| -> JniResult<()> {
            let daddr = env.new_string(record.dst.ip().to_string())?;
            env.call_method(
                service,
                "accountUsage",
                "(JIILjava/lang/String;IIJJ)V",
                &[
                    JValue::Long(record.time_ms),
                    JValue::Int(record.version as jint),
                    JValue::Int(record.protocol as jint),
                    JValue::Object(&daddr),
                    JValue::Int(record.dst.port() as jint),
                    JValue::Int(record.uid),
                    JValue::Long(record.sent as jlong),
                    JValue::Long(record.received as jlong),
                ],
            )?;
            Ok(())
        });
        self.settle("accountUsage", result);
    }

    fn is_domain_blocked(&mut self, name: &str) -> bool {
        let service = self.service;
        let result = self.env.with_local_frame(FRAME_CAPACITY, |env| -> JniResult<bool> {
            let name = env.new_string(name)?;
            env.call_method(service, "isDomainBlocked", "(Ljava/lang/String;)Z", &[JValue::Object(&name)])?
                .z()
        });
        self.settle("isDomainBlocked", result).unwrap_or(false)
    }

    fn protect(&mut self, fd: RawFd) -> bool {
        let result = self
            .env
            .call_method(self.service, "protect", "(I)Z", &[JValue::Int(fd as jint)])
            .and_then(|value| value.z());
        self.settle("protect", result).unwrap_or(false)
    }

    fn report_error(&mut self, code: i32, message: &str) {
        let service = self.service;
        let result = self.env.with_local_frame(FRAME_CAPACITY, |env| -> JniResult<()> {
            let message = env.new_string(message)?;
            env.call_method(
                service,
                "nativeError",
                "(ILjava/lang/String;)V",
                &[JValue::Int(code), JValue::Object(&message)],
            )?;
            Ok(())
        });
        self.settle("nativeError", result);
    }
}

fn optional_string(env: &mut JNIEnv<'_>, value: &JString<'_>) -> Option<String> {
    if value.is_null() {
        return None;
    }
    env.get_string(value).ok().map(Into::into)
}

fn report(result: crate::Result<()>, what: &str) {
    if let Err(e) = result {
        error!("{} failed: {}", what, e);
    }
}

#[no_mangle]
pub extern "system" fn Java_dev_tunwall_TunwallService_jni_1init<'local>(
    _env: JNIEnv<'local>,
    _service: JObject<'local>,
    sdk: jint,
) -> jlong {
    let handle = api::init(sdk);
    android_log(4, &format!("=== tunwall initialized, sdk {} handle {} ===", sdk, handle));
    handle
}

#[no_mangle]
pub extern "system" fn Java_dev_tunwall_TunwallService_jni_1start<'local>(
    _env: JNIEnv<'local>,
    _service: JObject<'local>,
    context: jlong,
    log_level: jint,
) {
    report(api::start(context, log_level), "start");
}

#[no_mangle]
pub extern "system" fn Java_dev_tunwall_TunwallService_jni_1run<'local>(
    mut env: JNIEnv<'local>,
    service: JObject<'local>,
    context: jlong,
    tun: jint,
    fwd53: jboolean,
    rcode: jint,
) {
    info!("=== jni_run tun={} fwd53={} rcode={} ===", tun, fwd53, rcode);
    let mut host = JniHost::new(&mut env, &service);
    // Fatal errors already reached the service through nativeError
    report(api::run(context, tun, fwd53 != JNI_FALSE, rcode, &mut host), "run");
    info!("=== jni_run exited ===");
}

#[no_mangle]
pub extern "system" fn Java_dev_tunwall_TunwallService_jni_1stop<'local>(
    _env: JNIEnv<'local>,
    _service: JObject<'local>,
    context: jlong,
) {
    report(api::stop(context), "stop");
}

#[no_mangle]
pub extern "system" fn Java_dev_tunwall_TunwallService_jni_1clear<'local>(
    _env: JNIEnv<'local>,
    _service: JObject<'local>,
    context: jlong,
) {
    report(api::clear(context), "clear");
}

#[no_mangle]
pub extern "system" fn Java_dev_tunwall_TunwallService_jni_1get_1mtu<'local>(
    _env: JNIEnv<'local>,
    _service: JObject<'local>,
    context: jlong,
) -> jint {
    match api::mtu(context) {
        Ok(mtu) => mtu as jint,
        Err(e) => {
            error!("get_mtu failed: {}", e);
            0
        }
    }
}

/// `[icmp, udp, tcp, open_fds, fd_limit]`
#[no_mangle]
pub extern "system" fn Java_dev_tunwall_TunwallService_jni_1get_1stats<'local>(
    env: JNIEnv<'local>,
    _service: JObject<'local>,
    context: jlong,
) -> jintArray {
    let stats = match api::query_stats(context) {
        Ok(stats) => stats,
        Err(e) => {
            error!("get_stats failed: {}", e);
            return std::ptr::null_mut();
        }
    };
    let values = [
        stats.icmp_count as jint,
        stats.udp_count as jint,
        stats.tcp_count as jint,
        stats.open_fds.min(jint::MAX as u64) as jint,
        stats.fd_limit.min(jint::MAX as u64) as jint,
    ];

    let array = match env.new_int_array(values.len() as i32) {
        Ok(array) => array,
        Err(e) => {
            error!("new_int_array failed: {}", e);
            return std::ptr::null_mut();
        }
    };
    if let Err(e) = env.set_int_array_region(&array, 0, &values) {
        error!("set_int_array_region failed: {}", e);
        return std::ptr::null_mut();
    }
    array.into_raw()
}

#[no_mangle]
pub extern "system" fn Java_dev_tunwall_TunwallService_jni_1pcap<'local>(
    mut env: JNIEnv<'local>,
    _service: JObject<'local>,
    context: jlong,
    name: JString<'local>,
    record_size: jint,
    file_size: jint,
) {
    let path = optional_string(&mut env, &name);
    debug!("pcap {:?} record {} max {}", path, record_size, file_size);
    report(
        api::configure_capture(context, path.as_deref(), record_size, file_size),
        "pcap",
    );
}

#[no_mangle]
pub extern "system" fn Java_dev_tunwall_TunwallService_jni_1socks5<'local>(
    mut env: JNIEnv<'local>,
    _service: JObject<'local>,
    context: jlong,
    addr: JString<'local>,
    port: jint,
    username: JString<'local>,
    password: JString<'local>,
) {
    let addr = optional_string(&mut env, &addr);
    let username = optional_string(&mut env, &username);
    let password = optional_string(&mut env, &password);
    report(
        api::configure_upstream_relay(context, addr.as_deref(), port, username.as_deref(), password.as_deref()),
        "socks5",
    );
}

#[no_mangle]
pub extern "system" fn Java_dev_tunwall_TunwallService_jni_1done<'local>(
    _env: JNIEnv<'local>,
    _service: JObject<'local>,
    context: jlong,
) {
    report(api::done(context), "done");
    android_log(4, "=== tunwall done ===");
}

#[no_mangle]
pub extern "system" fn Java_dev_tunwall_Util_is_1numeric_1address<'local>(
    mut env: JNIEnv<'local>,
    _class: JObject<'local>,
    ip: JString<'local>,
) -> jboolean {
    match optional_string(&mut env, &ip) {
        Some(text) if api::is_numeric_address(&text) => JNI_TRUE,
        _ => JNI_FALSE,
    }
}
