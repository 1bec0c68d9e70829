//! DNS wire exchanges: one UDP round-trip per query, with retry, a global
//! pacing limiter and typed rcode handling.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use domain::base::iana::Rcode;
use domain::base::message::Message;
use domain::base::message_builder::MessageBuilder;
use domain::base::name::FlattenInto as _;
use domain::base::Rtype;
use domain::rdata::AllRecordData;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{DomainName, Error};

const EXCHANGE_TIMEOUT: Duration = Duration::from_millis(500);
const RETRIES: u32 = 3;
const RETRY_BASE: Duration = Duration::from_millis(50);
const LIMITER_PERIOD: Duration = Duration::from_millis(20);
const MAX_RESPONSE: usize = 4096;

/// Paces outbound queries: one permit per `period`, burst of one.
///
/// Callers queue on the internal mutex, so permits are handed out in FIFO
/// order and dropping a waiting future releases its slot.
pub struct RateLimiter {
    period: Duration,
    next: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            next: Mutex::new(None),
        }
    }

    pub async fn acquire(&self) {
        let at = {
            let mut next = self.next.lock().await;
            let now = Instant::now();
            let at = match *next {
                Some(at) if at > now => at,
                _ => now,
            };
            *next = Some(at + self.period);
            at
        };
        tokio::time::sleep_until(at).await;
    }
}

/// A reentrant DNS client: every exchange builds its own message and socket,
/// only the limiter is shared.
pub struct Client {
    timeout: Duration,
    limiter: RateLimiter,
}

impl Default for Client {
    fn default() -> Self {
        Self {
            timeout: EXCHANGE_TIMEOUT,
            limiter: RateLimiter::new(LIMITER_PERIOD),
        }
    }
}

impl Client {
    /// Queries `server` for `name`/`rtype`, retrying transport and server
    /// failures up to three times with doubling backoff. NXDOMAIN is final
    /// and never retried.
    pub async fn exchange(
        &self,
        server: SocketAddr,
        name: &DomainName,
        rtype: Rtype,
    ) -> Result<Message<Vec<u8>>, Error> {
        let mut wait = RETRY_BASE;
        let mut last = Error::Timeout { server };

        for attempt in 0..RETRIES {
            if attempt > 0 {
                tokio::time::sleep(wait).await;
                wait *= 2;
            }
            self.limiter.acquire().await;

            match self.exchange_once(server, name, rtype).await {
                Ok(msg) => return Ok(msg),
                Err(err @ Error::NxDomain(_)) => return Err(err),
                Err(err) => {
                    tracing::debug!(%server, domain = %name, %err, "DNS exchange failed");
                    last = err;
                }
            }
        }

        Err(last)
    }

    async fn exchange_once(
        &self,
        server: SocketAddr,
        name: &DomainName,
        rtype: Rtype,
    ) -> Result<Message<Vec<u8>>, Error> {
        let query = build_query(name, rtype);

        let bind: SocketAddr = if server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(server).await?;
        socket.send(query.as_slice()).await?;

        let mut buf = vec![0u8; MAX_RESPONSE];
        loop {
            let len = tokio::time::timeout(self.timeout, socket.recv(&mut buf))
                .await
                .map_err(|_| Error::Timeout { server })??;

            let Ok(response) = Message::from_octets(buf[..len].to_vec()) else {
                continue;
            };
            if !response.header().qr() || response.header().id() != query.header().id() {
                // stray datagram, keep waiting for our answer
                continue;
            }

            return match response.header().rcode() {
                Rcode::NOERROR => Ok(response),
                Rcode::NXDOMAIN => Err(Error::NxDomain(name.to_string())),
                rcode => Err(Error::ServerFailure { server, rcode }),
            };
        }
    }
}

fn build_query(name: &DomainName, rtype: Rtype) -> Message<Vec<u8>> {
    let mut builder = MessageBuilder::new_vec().question();
    builder.header_mut().set_rd(true);
    builder.header_mut().set_random_id();
    builder
        .push((name.clone(), rtype))
        .expect("Vec-backed message builder never fails");
    builder.into_message()
}

/// Record data reduced to what the resolver acts on.
#[derive(Debug, Clone)]
pub enum Rdata {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Cname(DomainName),
    Ns(DomainName),
    Soa,
    Other,
}

impl Rdata {
    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Rdata::A(ip) => Some(IpAddr::V4(*ip)),
            Rdata::Aaaa(ip) => Some(IpAddr::V6(*ip)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimpleRecord {
    pub owner: DomainName,
    pub data: Rdata,
}

pub enum MessageSection {
    Answer,
    Authority,
    Additional,
}

/// Flattens one message section into owned records, skipping anything that
/// does not parse.
pub fn section_records(msg: &Message<Vec<u8>>, section: MessageSection) -> Vec<SimpleRecord> {
    let section = match section {
        MessageSection::Answer => msg.answer(),
        MessageSection::Authority => msg.authority(),
        MessageSection::Additional => msg.additional(),
    };
    let Ok(section) = section else {
        return Vec::new();
    };

    let mut records = Vec::new();
    for record in section {
        let Ok(record) = record else { continue };
        let Ok(record) = record.into_any_record::<AllRecordData<_, _>>() else {
            continue;
        };
        let owner: DomainName = record.owner().clone().flatten_into();
        let data = match record.data() {
            AllRecordData::A(a) => Rdata::A(a.addr()),
            AllRecordData::Aaaa(aaaa) => Rdata::Aaaa(aaaa.addr()),
            AllRecordData::Cname(cname) => Rdata::Cname(cname.cname().clone().flatten_into()),
            AllRecordData::Ns(ns) => Rdata::Ns(ns.nsdname().clone().flatten_into()),
            AllRecordData::Soa(_) => Rdata::Soa,
            _ => Rdata::Other,
        };
        records.push(SimpleRecord { owner, data });
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn limiter_spaces_out_permits() {
        let limiter = RateLimiter::new(Duration::from_millis(20));
        let start = Instant::now();

        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;

        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test(start_paused = true)]
    async fn limiter_allows_immediate_first_permit() {
        let limiter = RateLimiter::new(Duration::from_millis(20));
        let start = Instant::now();

        limiter.acquire().await;

        assert!(start.elapsed() < Duration::from_millis(1));
    }
}
