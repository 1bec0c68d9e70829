//! Wire-level tests for the iterative resolver, against in-process mock DNS
//! servers.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use domain::base::iana::Rcode;
use domain::base::message::Message;
use domain::base::message_builder::MessageBuilder;
use domain::base::name::Name;
use domain::base::{Rtype, Serial, Ttl};
use domain::rdata::{Cname, Ns, Soa, A};
use tokio::net::UdpSocket;

use wg_steward::resolver::{Error, Iterative};

type DomainName = Name<Vec<u8>>;

fn name(s: &str) -> DomainName {
    DomainName::vec_from_str(s).unwrap()
}

/// One recorded query: lowercased qname without the trailing dot, plus the
/// query type.
type QueryLog = Arc<Mutex<Vec<(String, Rtype)>>>;

async fn spawn_mock<F>(handler: F) -> (SocketAddr, QueryLog)
where
    F: Fn(&str, Rtype, &Message<Vec<u8>>) -> Vec<u8> + Send + 'static,
{
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let log: QueryLog = Arc::new(Mutex::new(Vec::new()));

    let task_log = log.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
                break;
            };
            let Ok(request) = Message::from_octets(buf[..len].to_vec()) else {
                continue;
            };
            let Ok(question) = request.sole_question() else {
                continue;
            };
            let qname = question
                .qname()
                .to_string()
                .trim_end_matches('.')
                .to_ascii_lowercase();
            let qtype = question.qtype();
            task_log.lock().unwrap().push((qname.clone(), qtype));

            let reply = handler(&qname, qtype, &request);
            let _ = socket.send_to(&reply, peer).await;
        }
    });

    (addr, log)
}

fn empty_reply(request: &Message<Vec<u8>>) -> Vec<u8> {
    MessageBuilder::new_vec()
        .start_answer(request, Rcode::NOERROR)
        .unwrap()
        .into_message()
        .into_octets()
}

fn rcode_reply(request: &Message<Vec<u8>>, rcode: Rcode) -> Vec<u8> {
    MessageBuilder::new_vec()
        .start_answer(request, rcode)
        .unwrap()
        .into_message()
        .into_octets()
}

fn a_reply(request: &Message<Vec<u8>>, owner: &str, ip: Ipv4Addr) -> Vec<u8> {
    let mut answer = MessageBuilder::new_vec()
        .start_answer(request, Rcode::NOERROR)
        .unwrap();
    answer.push((name(owner), 300, A::new(ip))).unwrap();
    answer.into_message().into_octets()
}

fn cname_reply(request: &Message<Vec<u8>>, owner: &str, target: &str) -> Vec<u8> {
    let mut answer = MessageBuilder::new_vec()
        .start_answer(request, Rcode::NOERROR)
        .unwrap();
    answer
        .push((name(owner), 300, Cname::new(name(target))))
        .unwrap();
    answer.into_message().into_octets()
}

/// An NS answer for `zone`, optionally with an A glue record for the name
/// server.
fn referral_reply(
    request: &Message<Vec<u8>>,
    zone: &str,
    ns: &str,
    glue: Option<Ipv4Addr>,
) -> Vec<u8> {
    let mut answer = MessageBuilder::new_vec()
        .start_answer(request, Rcode::NOERROR)
        .unwrap();
    answer.push((name(zone), 300, Ns::new(name(ns)))).unwrap();

    let mut additional = answer.additional();
    if let Some(ip) = glue {
        additional.push((name(ns), 300, A::new(ip))).unwrap();
    }
    additional.into_message().into_octets()
}

/// An empty answer whose authority section carries a SOA for `zone`.
fn soa_reply(request: &Message<Vec<u8>>, zone: &str) -> Vec<u8> {
    let mut authority = MessageBuilder::new_vec()
        .start_answer(request, Rcode::NOERROR)
        .unwrap()
        .authority();
    authority
        .push((
            name(zone),
            300,
            Soa::new(
                name(&format!("ns1.{zone}")),
                name(&format!("hostmaster.{zone}")),
                Serial::from(2024010101),
                Ttl::from_secs(7200),
                Ttl::from_secs(3600),
                Ttl::from_secs(1209600),
                Ttl::from_secs(300),
            ),
        ))
        .unwrap();
    authority.into_message().into_octets()
}

#[tokio::test]
async fn literal_addresses_keep_ip_and_port() {
    let resolver = Iterative::new(vec![]);

    for (input, ip, port) in [
        ("198.51.100.1:51820", "198.51.100.1", 51820u16),
        ("[2001:db8::1]:443", "2001:db8::1", 443),
    ] {
        let addr = resolver.resolve_udp_addr(input).await.unwrap();
        assert_eq!(addr.port(), port);
        assert_eq!(
            addr.ip().to_canonical(),
            ip.parse::<std::net::IpAddr>().unwrap().to_canonical()
        );
    }
}

#[tokio::test]
async fn nxdomain_is_final_and_never_retried() {
    let (seed, log) = spawn_mock(|_, _, request| rcode_reply(request, Rcode::NXDOMAIN)).await;

    let resolver = Iterative::new(vec![seed]);
    let err = resolver
        .resolve_udp_addr("missing.example.com:51820")
        .await
        .unwrap_err();

    assert!(matches!(err, Error::NxDomain(_)), "got {err:?}");
    assert_eq!(log.lock().unwrap().len(), 1, "NXDOMAIN must not be retried");
}

#[tokio::test]
async fn servfail_is_retried_exactly_three_times() {
    let (seed, log) = spawn_mock(|_, _, request| rcode_reply(request, Rcode::SERVFAIL)).await;

    let resolver = Iterative::new(vec![seed]);
    let err = resolver
        .resolve_udp_addr("flaky.example.com:51820")
        .await
        .unwrap_err();

    assert!(matches!(err, Error::ServerFailure { .. }), "got {err:?}");
    assert_eq!(log.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn authority_walk_follows_glue() {
    let target_ip = Ipv4Addr::new(93, 184, 216, 34);

    let (authority, authority_log) = spawn_mock(move |qname, qtype, request| {
        assert_eq!(qname, "www.example.com");
        match qtype {
            Rtype::A => a_reply(request, "www.example.com", target_ip),
            _ => empty_reply(request),
        }
    })
    .await;

    let (seed, seed_log) = spawn_mock(move |qname, qtype, request| {
        match (qname, qtype) {
            // no alias to unfold
            ("www.example.com", Rtype::A) => empty_reply(request),
            ("www.example.com", Rtype::NS) => referral_reply(
                request,
                "www.example.com",
                "ns1.example.com",
                Some(Ipv4Addr::LOCALHOST),
            ),
            _ => empty_reply(request),
        }
    })
    .await;

    let resolver = Iterative::new(vec![seed]).with_authority_port(authority.port());
    let addr = resolver
        .resolve_udp_addr("www.example.com:51820")
        .await
        .unwrap();

    assert_eq!(addr, SocketAddr::new(target_ip.into(), 51820));

    // the seed saw the CNAME probe and the NS walk, the authority saw only
    // the final address queries
    let seed_queries = seed_log.lock().unwrap().clone();
    assert!(seed_queries.contains(&("www.example.com".to_owned(), Rtype::NS)));
    let authority_queries = authority_log.lock().unwrap().clone();
    assert!(!authority_queries.is_empty());
    assert!(authority_queries
        .iter()
        .all(|(qname, _)| qname == "www.example.com"));
}

#[tokio::test]
async fn authority_without_glue_is_resolved_via_seeds() {
    let target_ip = Ipv4Addr::new(203, 0, 113, 99);

    let (authority, _) = spawn_mock(move |_, qtype, request| match qtype {
        Rtype::A => a_reply(request, "www.example.com", target_ip),
        _ => empty_reply(request),
    })
    .await;

    let (seed, _) = spawn_mock(move |qname, qtype, request| match (qname, qtype) {
        ("www.example.com", Rtype::NS) => {
            referral_reply(request, "www.example.com", "ns.example.net", None)
        }
        ("ns.example.net", Rtype::A) => a_reply(request, "ns.example.net", Ipv4Addr::LOCALHOST),
        _ => empty_reply(request),
    })
    .await;

    let resolver = Iterative::new(vec![seed]).with_authority_port(authority.port());
    let addr = resolver
        .resolve_udp_addr("www.example.com:51820")
        .await
        .unwrap();

    assert_eq!(addr, SocketAddr::new(target_ip.into(), 51820));
}

#[tokio::test]
async fn cname_is_unfolded_before_the_walk() {
    let target_ip = Ipv4Addr::new(198, 51, 100, 200);

    let (authority, authority_log) = spawn_mock(move |_, qtype, request| match qtype {
        Rtype::A => a_reply(request, "real.example.com", target_ip),
        _ => empty_reply(request),
    })
    .await;

    let (seed, _) = spawn_mock(move |qname, qtype, request| match (qname, qtype) {
        ("alias.example.com", Rtype::A) => {
            cname_reply(request, "alias.example.com", "real.example.com")
        }
        ("real.example.com", Rtype::NS) => referral_reply(
            request,
            "real.example.com",
            "ns1.example.com",
            Some(Ipv4Addr::LOCALHOST),
        ),
        _ => empty_reply(request),
    })
    .await;

    let resolver = Iterative::new(vec![seed]).with_authority_port(authority.port());
    let addr = resolver
        .resolve_udp_addr("alias.example.com:51820")
        .await
        .unwrap();

    assert_eq!(addr, SocketAddr::new(target_ip.into(), 51820));

    // the authority is asked for the canonical name, not the alias
    let queries = authority_log.lock().unwrap().clone();
    assert!(queries.iter().all(|(qname, _)| qname == "real.example.com"));
}

#[tokio::test]
async fn soa_in_authority_section_restarts_the_walk_at_its_zone() {
    let target_ip = Ipv4Addr::new(192, 0, 2, 80);

    let (authority, _) = spawn_mock(move |_, qtype, request| match qtype {
        Rtype::A => a_reply(request, "www.deep.sub.example.com", target_ip),
        _ => empty_reply(request),
    })
    .await;

    let (seed, seed_log) = spawn_mock(move |qname, qtype, request| match (qname, qtype) {
        ("www.deep.sub.example.com", Rtype::NS) => soa_reply(request, "example.com"),
        ("example.com", Rtype::NS) => referral_reply(
            request,
            "example.com",
            "ns1.example.com",
            Some(Ipv4Addr::LOCALHOST),
        ),
        _ => empty_reply(request),
    })
    .await;

    let resolver = Iterative::new(vec![seed]).with_authority_port(authority.port());
    let addr = resolver
        .resolve_udp_addr("www.deep.sub.example.com:51820")
        .await
        .unwrap();

    assert_eq!(addr, SocketAddr::new(target_ip.into(), 51820));

    // the walk jumps straight from the full name to the SOA's zone without
    // trying the intermediate labels
    let queries = seed_log.lock().unwrap().clone();
    let ns_queries: Vec<&str> = queries
        .iter()
        .filter(|(_, qtype)| *qtype == Rtype::NS)
        .map(|(qname, _)| qname.as_str())
        .collect();
    assert_eq!(ns_queries, vec!["www.deep.sub.example.com", "example.com"]);
}

#[tokio::test]
async fn seed_pool_exhaustion_reports_the_last_failure() {
    // a bound socket we never answer on: every exchange times out
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let seed = silent.local_addr().unwrap();

    let resolver = Iterative::new(vec![seed]);
    let err = resolver
        .resolve_udp_addr("unreachable.example.com:51820")
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Timeout { .. }), "got {err:?}");
}

#[tokio::test]
async fn queries_are_paced_by_the_global_limiter() {
    // three SERVFAIL attempts pay at least two limiter periods plus backoff
    let (seed, _) = spawn_mock(|_, _, request| rcode_reply(request, Rcode::SERVFAIL)).await;

    let resolver = Iterative::new(vec![seed]);
    let start = std::time::Instant::now();
    let _ = resolver
        .resolve_udp_addr("paced.example.com:51820")
        .await
        .unwrap_err();

    assert!(start.elapsed() >= std::time::Duration::from_millis(40));
}
