use std::net::SocketAddr;
use std::time::Duration;

use dns_types::protocol::types::*;

use crate::util::net::send_and_receive;

/// Send an iterative (`RD=0`) A-query for `qname` to `address` and
/// wait for a reply. Returns `None` on timeout, I/O failure, or a
/// reply whose `id` does not match the query's: per the referral
/// algorithm, all of these are treated identically as "this hint had
/// nothing to say", and the caller moves on to the next hint.
pub fn query_nameserver(address: SocketAddr, qname: &DomainName, timeout: Duration) -> Option<Message> {
    let question = Question {
        name: qname.clone(),
        qtype: QueryType::Record(RecordType::A),
        qclass: QueryClass::Record(RecordClass::IN),
    };
    let id = rand::random::<u16>();
    let request = Message::from_question(id, question, false);

    let serialised = request.to_octets().ok()?;
    let reply_bytes = send_and_receive(address, &serialised, timeout).ok()??;
    let response = Message::from_octets(&reply_bytes).ok()?;

    if response.header.id != request.header.id {
        return None;
    }

    Some(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, UdpSocket};
    use std::thread;

    #[test]
    fn query_nameserver_times_out_when_nobody_answers() {
        // bind a socket just to reserve a port nobody will answer on
        let reserved = UdpSocket::bind("127.0.0.1:0").unwrap();
        let address = SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::LOCALHOST), reserved.local_addr().unwrap().port());
        drop(reserved);

        let qname = DomainName::from_dotted_string("example.com.").unwrap();
        let result = query_nameserver(address, &qname, Duration::from_millis(200));
        assert!(result.is_none());
    }

    #[test]
    fn query_nameserver_rejects_mismatched_id() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let address = server.local_addr().unwrap();

        let handle = thread::spawn(move || {
            let mut buf = [0u8; 1024];
            if let Ok((n, from)) = server.recv_from(&mut buf) {
                if let Ok(mut msg) = Message::from_octets(&buf[..n]) {
                    msg.header.id = msg.header.id.wrapping_add(1);
                    let reply = msg.make_response();
                    if let Ok(bytes) = reply.to_octets() {
                        let _ = server.send_to(&bytes, from);
                    }
                }
            }
        });

        let qname = DomainName::from_dotted_string("example.com.").unwrap();
        let result = query_nameserver(address, &qname, Duration::from_secs(1));
        handle.join().unwrap();

        assert!(result.is_none());
    }
}
