//! Wire protocol frames shared by the bidder-facing and ring-facing sides.
//!
//! Every frame is one newline-terminated UTF-8 text line. The token
//! vocabulary (`OFERTA_MAX`, `SALIR`, `COORDINADOR`, ...) is the protocol
//! constant set; it must not be translated.

use crate::cluster::ReplicaId;
use crate::utils::SubastaError;

/// Rejection frame for an unparseable bid line.
pub const ERR_BAD_FORMAT: &str = "ERR:Formato de oferta incorrecto";

/// Rejection frame for a non-positive bid.
pub const ERR_NON_POSITIVE: &str = "ERR:Oferta debe ser positiva";

/// Rejection frame for a bidder arriving after the session deadline.
pub const ERR_SESSION_OVER: &str = "ERR:Subasta finalizada";

/// Bidder command for leaving the auction gracefully.
pub const CMD_LEAVE: &str = "SALIR";

/// Renders a bid amount. Whole amounts keep a trailing `.0` so the wire
/// form is stable ("75.0", "75.5").
pub fn fmt_amount(amount: f64) -> String {
    if amount == amount.trunc() {
        format!("{:.1}", amount)
    } else {
        format!("{}", amount)
    }
}

/// One command line received from a bidder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClientCmd {
    /// A monetary offer.
    Bid(f64),
    /// Graceful exit (`SALIR`, case-insensitive).
    Leave,
}

/// Rejection category for an invalid bidder line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdError {
    BadFormat,
    NonPositive,
}

impl CmdError {
    /// The `ERR:` frame to send back for this rejection.
    pub fn frame(&self) -> &'static str {
        match self {
            CmdError::BadFormat => ERR_BAD_FORMAT,
            CmdError::NonPositive => ERR_NON_POSITIVE,
        }
    }
}

impl ClientCmd {
    /// Parses one bidder line per the command grammar.
    pub fn parse(line: &str) -> Result<Self, CmdError> {
        let line = line.trim();
        if line.eq_ignore_ascii_case(CMD_LEAVE) {
            return Ok(ClientCmd::Leave);
        }
        let amount: f64 =
            line.parse().map_err(|_| CmdError::BadFormat)?;
        if !amount.is_finite() {
            return Err(CmdError::BadFormat);
        }
        if amount <= 0.0 {
            return Err(CmdError::NonPositive);
        }
        Ok(ClientCmd::Bid(amount))
    }
}

/// Frames exchanged between replicas on the ring port.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerMsg {
    /// A freshly elected leader announcing itself.
    Coordinator { id: ReplicaId },
    /// Leader liveness ping.
    Heartbeat { id: ReplicaId, millis: i64 },
    /// Replication of a newly committed high bid.
    SyncState {
        bid: f64,
        address: String,
        millis: i64,
    },
    /// Ask the receiver to run an election now.
    ElectionRequest,
}

impl PeerMsg {
    /// Renders the frame line (without the trailing newline).
    pub fn to_frame(&self) -> String {
        match self {
            PeerMsg::Coordinator { id } => format!("COORDINADOR:{}", id),
            PeerMsg::Heartbeat { id, millis } => {
                format!("HEARTBEAT:{}:{}", id, millis)
            }
            PeerMsg::SyncState {
                bid,
                address,
                millis,
            } => format!(
                "SYNC_ESTADO:{}:{}:{}",
                fmt_amount(*bid),
                address,
                millis
            ),
            PeerMsg::ElectionRequest => "ELECCION_REQUEST".into(),
        }
    }

    /// Parses one ring frame line.
    pub fn parse(line: &str) -> Result<Self, SubastaError> {
        let line = line.trim();
        if line == "ELECCION_REQUEST" {
            return Ok(PeerMsg::ElectionRequest);
        }
        if let Some(rest) = line.strip_prefix("COORDINADOR:") {
            return Ok(PeerMsg::Coordinator { id: rest.parse()? });
        }
        if let Some(rest) = line.strip_prefix("HEARTBEAT:") {
            if let Some((id, millis)) = rest.split_once(':') {
                return Ok(PeerMsg::Heartbeat {
                    id: id.parse()?,
                    millis: millis.parse()?,
                });
            }
        }
        if let Some(rest) = line.strip_prefix("SYNC_ESTADO:") {
            let mut parts = rest.splitn(3, ':');
            if let (Some(bid), Some(address), Some(millis)) =
                (parts.next(), parts.next(), parts.next())
            {
                return Ok(PeerMsg::SyncState {
                    bid: bid.parse()?,
                    address: address.into(),
                    millis: millis.parse()?,
                });
            }
        }
        Err(SubastaError::msg(format!(
            "unrecognized ring frame '{}'",
            line
        )))
    }
}

/// Renders the session-start push frame.
pub fn inicio_frame(secs: u64) -> String {
    format!("INICIO:DURACION:{}", secs)
}

/// Renders a bid confirmation around a store high-bid snapshot
/// (`OFERTA_MAX:<addr>:<bid>`).
pub fn conf_frame(high: &str, secs_left: i64, leading: bool) -> String {
    format!(
        "CONF:{}:TIEMPO:{}:ESTADO:{}",
        high,
        secs_left,
        if leading { "LIDER" } else { "SIGUIENDO" }
    )
}

/// Renders the periodic high-bid broadcast frame.
pub fn sync_frame(high: &str, secs_left: i64) -> String {
    format!("SYNC:{}:TIEMPO:{}", high, secs_left)
}

/// Renders the final result frame.
pub fn resultado_frame(address: &str, bid: f64) -> String {
    format!("RESULTADO:{}:OFERTA:{}", address, fmt_amount(bid))
}

/// Renders the redirect frame pointing a bidder at the leader.
pub fn redir_frame(host: &str, port: u16) -> String {
    format!("REDIR:{}:{}", host, port)
}

/// Frames a bidder can receive from a server, parsed form.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    /// Session entered Running; payload is the total duration in seconds.
    Inicio { secs: u64 },
    /// Confirmation of a submitted bid, echoing the current standings.
    Conf {
        address: String,
        bid: f64,
        secs_left: i64,
        leading: bool,
    },
    /// Periodic standings broadcast.
    Sync {
        address: String,
        bid: f64,
        secs_left: i64,
    },
    /// Final winner announcement.
    Resultado { address: String, bid: f64 },
    /// Server-side rejection; payload is the text after `ERR:`.
    Error { message: String },
    /// Follower pointing the bidder at the leader's client address.
    Redir { host: String, port: u16 },
}

impl ServerFrame {
    /// Parses one server-to-bidder frame line.
    pub fn parse(line: &str) -> Result<Self, SubastaError> {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("INICIO:DURACION:") {
            return Ok(ServerFrame::Inicio { secs: rest.parse()? });
        }
        if let Some(rest) = line.strip_prefix("CONF:OFERTA_MAX:") {
            let parts: Vec<&str> = rest.split(':').collect();
            if parts.len() == 6
                && parts[2] == "TIEMPO"
                && parts[4] == "ESTADO"
            {
                let leading = match parts[5] {
                    "LIDER" => true,
                    "SIGUIENDO" => false,
                    _ => {
                        return Err(SubastaError::msg(format!(
                            "bad ESTADO token '{}'",
                            parts[5]
                        )))
                    }
                };
                return Ok(ServerFrame::Conf {
                    address: parts[0].into(),
                    bid: parts[1].parse()?,
                    secs_left: parts[3].parse()?,
                    leading,
                });
            }
        }
        if let Some(rest) = line.strip_prefix("SYNC:OFERTA_MAX:") {
            let parts: Vec<&str> = rest.split(':').collect();
            if parts.len() == 4 && parts[2] == "TIEMPO" {
                return Ok(ServerFrame::Sync {
                    address: parts[0].into(),
                    bid: parts[1].parse()?,
                    secs_left: parts[3].parse()?,
                });
            }
        }
        if let Some(rest) = line.strip_prefix("RESULTADO:") {
            let parts: Vec<&str> = rest.split(':').collect();
            if parts.len() == 3 && parts[1] == "OFERTA" {
                return Ok(ServerFrame::Resultado {
                    address: parts[0].into(),
                    bid: parts[2].parse()?,
                });
            }
        }
        if let Some(rest) = line.strip_prefix("ERR:") {
            return Ok(ServerFrame::Error {
                message: rest.into(),
            });
        }
        if let Some(rest) = line.strip_prefix("REDIR:") {
            if let Some((host, port)) = rest.rsplit_once(':') {
                return Ok(ServerFrame::Redir {
                    host: host.into(),
                    port: port.parse()?,
                });
            }
        }
        Err(SubastaError::msg(format!(
            "unrecognized server frame '{}'",
            line
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amount_rendering() {
        assert_eq!(fmt_amount(75.0), "75.0");
        assert_eq!(fmt_amount(75.5), "75.5");
        assert_eq!(fmt_amount(0.0), "0.0");
        assert_eq!(fmt_amount(1234.25), "1234.25");
    }

    #[test]
    fn client_cmd_grammar() {
        assert_eq!(ClientCmd::parse("50"), Ok(ClientCmd::Bid(50.0)));
        assert_eq!(ClientCmd::parse(" 75.5 "), Ok(ClientCmd::Bid(75.5)));
        assert_eq!(ClientCmd::parse("SALIR"), Ok(ClientCmd::Leave));
        assert_eq!(ClientCmd::parse("salir"), Ok(ClientCmd::Leave));
        assert_eq!(ClientCmd::parse("abc"), Err(CmdError::BadFormat));
        assert_eq!(ClientCmd::parse(""), Err(CmdError::BadFormat));
        assert_eq!(ClientCmd::parse("NaN"), Err(CmdError::BadFormat));
        assert_eq!(ClientCmd::parse("-5"), Err(CmdError::NonPositive));
        assert_eq!(ClientCmd::parse("0"), Err(CmdError::NonPositive));
    }

    #[test]
    fn cmd_error_frames() {
        assert_eq!(
            CmdError::BadFormat.frame(),
            "ERR:Formato de oferta incorrecto"
        );
        assert_eq!(
            CmdError::NonPositive.frame(),
            "ERR:Oferta debe ser positiva"
        );
    }

    #[test]
    fn peer_msg_frames() {
        let msgs = [
            PeerMsg::Coordinator { id: 3 },
            PeerMsg::Heartbeat {
                id: 2,
                millis: 170000,
            },
            PeerMsg::SyncState {
                bid: 200.0,
                address: "127.0.0.1".into(),
                millis: 170001,
            },
            PeerMsg::ElectionRequest,
        ];
        for msg in msgs {
            assert_eq!(PeerMsg::parse(&msg.to_frame()), Ok(msg));
        }
        assert_eq!(
            PeerMsg::Coordinator { id: 3 }.to_frame(),
            "COORDINADOR:3"
        );
        assert_eq!(
            PeerMsg::SyncState {
                bid: 200.0,
                address: "10.0.0.7".into(),
                millis: 5,
            }
            .to_frame(),
            "SYNC_ESTADO:200.0:10.0.0.7:5"
        );
        assert!(PeerMsg::parse("HOLA:1").is_err());
        assert!(PeerMsg::parse("HEARTBEAT:x:1").is_err());
    }

    #[test]
    fn server_frame_parsing() {
        assert_eq!(
            ServerFrame::parse("INICIO:DURACION:90"),
            Ok(ServerFrame::Inicio { secs: 90 })
        );
        assert_eq!(
            ServerFrame::parse(
                "CONF:OFERTA_MAX:127.0.0.1:50.0:TIEMPO:85:ESTADO:LIDER"
            ),
            Ok(ServerFrame::Conf {
                address: "127.0.0.1".into(),
                bid: 50.0,
                secs_left: 85,
                leading: true,
            })
        );
        assert_eq!(
            ServerFrame::parse("SYNC:OFERTA_MAX:none:0.0:TIEMPO:88"),
            Ok(ServerFrame::Sync {
                address: "none".into(),
                bid: 0.0,
                secs_left: 88,
            })
        );
        assert_eq!(
            ServerFrame::parse("RESULTADO:127.0.0.1:OFERTA:75.0"),
            Ok(ServerFrame::Resultado {
                address: "127.0.0.1".into(),
                bid: 75.0,
            })
        );
        assert_eq!(
            ServerFrame::parse("ERR:Subasta finalizada"),
            Ok(ServerFrame::Error {
                message: "Subasta finalizada".into(),
            })
        );
        assert_eq!(
            ServerFrame::parse("REDIR:localhost:9092"),
            Ok(ServerFrame::Redir {
                host: "localhost".into(),
                port: 9092,
            })
        );
        assert!(ServerFrame::parse("RESULTADO:only").is_err());
        assert!(ServerFrame::parse("whatever").is_err());
    }

    #[test]
    fn frame_rendering_matches_grammar() {
        assert_eq!(inicio_frame(90), "INICIO:DURACION:90");
        assert_eq!(
            conf_frame("OFERTA_MAX:127.0.0.1:50.0", 85, true),
            "CONF:OFERTA_MAX:127.0.0.1:50.0:TIEMPO:85:ESTADO:LIDER"
        );
        assert_eq!(
            conf_frame("OFERTA_MAX:127.0.0.1:50.0", 85, false),
            "CONF:OFERTA_MAX:127.0.0.1:50.0:TIEMPO:85:ESTADO:SIGUIENDO"
        );
        assert_eq!(
            sync_frame("OFERTA_MAX:none:0.0", 90),
            "SYNC:OFERTA_MAX:none:0.0:TIEMPO:90"
        );
        assert_eq!(
            resultado_frame("127.0.0.1", 75.0),
            "RESULTADO:127.0.0.1:OFERTA:75.0"
        );
        assert_eq!(redir_frame("localhost", 9092), "REDIR:localhost:9092");
    }
}
