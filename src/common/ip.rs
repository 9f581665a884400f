//! IPアドレスユーティリティ
//!
//! クライアントIPの正規化とローカルIPv4の取得

use std::net::{IpAddr, SocketAddr, UdpSocket};

/// IPアドレスを正規化する
///
/// IPv4-mapped IPv6（::ffff:x.x.x.x）をIPv4に変換。
/// それ以外はそのまま返す。
pub fn normalize_ip(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                IpAddr::V4(v4)
            } else {
                IpAddr::V6(v6)
            }
        }
        v4 => v4,
    }
}

/// SocketAddrからIPアドレスを抽出し正規化する
pub fn normalize_socket_ip(addr: &SocketAddr) -> IpAddr {
    normalize_ip(addr.ip())
}

/// このホストの外向きIPv4アドレスを返す
///
/// UDPソケットを外部宛に「接続」してローカルアドレスを読むだけで、
/// パケットは送信されない。判定できない場合は127.0.0.1を返す。
pub fn local_ipv4() -> String {
    let fallback = "127.0.0.1".to_string();
    let socket = match UdpSocket::bind("0.0.0.0:0") {
        Ok(s) => s,
        Err(_) => return fallback,
    };
    if socket.connect("8.8.8.8:80").is_err() {
        return fallback;
    }
    match socket.local_addr() {
        Ok(addr) => addr.ip().to_string(),
        Err(_) => fallback,
    }
}
