//! 测试用证书与 rustls 配置。

#![allow(dead_code)]

use std::sync::Arc;

use rustls::{ClientConfig, RootCertStore, ServerConfig, crypto::CryptoProvider};
use rustls_pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use spark_engine::Engine;
use spark_engine_tls::TlsEngine;

pub const HOST: &str = "localhost";

pub struct Fixture {
    pub client: Arc<ClientConfig>,
    pub server: Arc<ServerConfig>,
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// 为 `hosts` 签发自签名证书，并构造互相信任的客户端/服务端配置。
pub fn fixture_for(hosts: &[&str]) -> Fixture {
    let names: Vec<String> = hosts.iter().map(|host| (*host).to_owned()).collect();
    let certified = rcgen::generate_simple_self_signed(names).expect("self-signed certificate");
    let cert = certified.cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));

    let server = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .expect("protocol versions")
        .with_no_client_auth()
        .with_single_cert(vec![cert.clone()], key)
        .expect("server certificate");

    let mut roots = RootCertStore::empty();
    roots.add(cert).expect("trust anchor");
    let client = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .expect("protocol versions")
        .with_root_certificates(roots)
        .with_no_client_auth();

    Fixture {
        client: Arc::new(client),
        server: Arc::new(server),
    }
}

pub fn fixture() -> Fixture {
    fixture_for(&[HOST])
}

pub fn server_name() -> ServerName<'static> {
    ServerName::try_from(HOST).expect("dns name")
}

/// 已调用 `init()` 的一对引擎。
pub fn engines(fixture: &Fixture) -> (TlsEngine, TlsEngine) {
    let mut client = TlsEngine::client(fixture.client.clone(), server_name()).unwrap();
    let mut server = TlsEngine::server(fixture.server.clone()).unwrap();
    client.init().unwrap();
    server.init().unwrap();
    (client, server)
}
