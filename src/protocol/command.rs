//! Wire command names
//!
//! Every message carries a 12-byte, NUL padded ASCII command. The constants
//! below are the full command set understood by this node.

/// Length of the command field in a message header
pub const COMMAND_SIZE: usize = 12;

pub const VERSION: &str = "version";
pub const VERACK: &str = "verack";
pub const ADDR: &str = "addr";
pub const GETADDR: &str = "getaddr";
pub const INV: &str = "inv";
pub const GETDATA: &str = "getdata";
pub const NOTFOUND: &str = "notfound";
pub const GETBLOCKS: &str = "getblocks";
pub const GETHEADERS: &str = "getheaders";
pub const TX: &str = "tx";
pub const BLOCK: &str = "block";
pub const HEADERS: &str = "headers";
pub const MERKLEBLOCK: &str = "merkleblock";
pub const CMPCTBLOCK: &str = "cmpctblock";
pub const GETBLOCKTXN: &str = "getblocktxn";
pub const BLOCKTXN: &str = "blocktxn";
pub const MEMPOOL: &str = "mempool";
pub const PING: &str = "ping";
pub const PONG: &str = "pong";
pub const REJECT: &str = "reject";
pub const FILTERLOAD: &str = "filterload";
pub const FILTERADD: &str = "filteradd";
pub const FILTERCLEAR: &str = "filterclear";
pub const FEEFILTER: &str = "feefilter";
pub const PROTOCONF: &str = "protoconf";
pub const SENDHEADERS: &str = "sendheaders";
pub const SENDCMPCT: &str = "sendcmpct";
pub const CREATESTREAM: &str = "createstrm";
pub const STREAMACK: &str = "streamack";
pub const DSDETECTED: &str = "dsdetected";
pub const REVOKEMID: &str = "revokemid";
pub const AUTHCH: &str = "authch";
pub const AUTHRESP: &str = "authresp";
pub const DATAREFTX: &str = "datareftx";
pub const EXTMSG: &str = "extmsg";

/// All commands this node recognizes
pub const ALL_COMMANDS: &[&str] = &[
    VERSION,
    VERACK,
    ADDR,
    GETADDR,
    INV,
    GETDATA,
    NOTFOUND,
    GETBLOCKS,
    GETHEADERS,
    TX,
    BLOCK,
    HEADERS,
    MERKLEBLOCK,
    CMPCTBLOCK,
    GETBLOCKTXN,
    BLOCKTXN,
    MEMPOOL,
    PING,
    PONG,
    REJECT,
    FILTERLOAD,
    FILTERADD,
    FILTERCLEAR,
    FEEFILTER,
    PROTOCONF,
    SENDHEADERS,
    SENDCMPCT,
    CREATESTREAM,
    STREAMACK,
    DSDETECTED,
    REVOKEMID,
    AUTHCH,
    AUTHRESP,
    DATAREFTX,
    EXTMSG,
];

/// Commands whose payload carries block content.
///
/// These are exempt from the general payload cap and are checked against
/// the maximum block size instead.
pub fn is_block_like(command: &str) -> bool {
    matches!(command, BLOCK | CMPCTBLOCK | BLOCKTXN)
}

/// Whether the command is known to this node
pub fn is_known(command: &str) -> bool {
    ALL_COMMANDS.contains(&command)
}

/// Encode a command into its fixed 12-byte header field
pub fn encode_command(command: &str) -> [u8; COMMAND_SIZE] {
    let mut out = [0u8; COMMAND_SIZE];
    let bytes = command.as_bytes();
    let len = bytes.len().min(COMMAND_SIZE);
    out[..len].copy_from_slice(&bytes[..len]);
    out
}

/// Decode a 12-byte command field.
///
/// Valid commands are printable ASCII followed only by NUL padding. Returns
/// `None` for anything else, including an empty command.
pub fn decode_command(raw: &[u8; COMMAND_SIZE]) -> Option<String> {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(COMMAND_SIZE);
    if end == 0 {
        return None;
    }
    if raw[end..].iter().any(|&b| b != 0) {
        return None;
    }
    if raw[..end].iter().any(|&b| !(0x20..=0x7e).contains(&b)) {
        return None;
    }
    Some(String::from_utf8_lossy(&raw[..end]).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_padding() {
        let raw = encode_command(VERACK);
        assert_eq!(&raw[..6], b"verack");
        assert!(raw[6..].iter().all(|&b| b == 0));
        assert_eq!(decode_command(&raw).as_deref(), Some(VERACK));
    }

    #[test]
    fn test_embedded_garbage_rejected() {
        let mut raw = encode_command("ping");
        raw[8] = b'x';
        assert_eq!(decode_command(&raw), None);
        assert_eq!(decode_command(&[0u8; COMMAND_SIZE]), None);

        let mut ctrl = encode_command("ping");
        ctrl[1] = 0x07;
        assert_eq!(decode_command(&ctrl), None);
    }

    #[test]
    fn test_block_like() {
        assert!(is_block_like(BLOCK));
        assert!(is_block_like(CMPCTBLOCK));
        assert!(is_block_like(BLOCKTXN));
        assert!(!is_block_like(TX));
        assert!(!is_block_like(GETBLOCKTXN));
    }

    #[test]
    fn test_all_commands_fit() {
        for cmd in ALL_COMMANDS {
            assert!(cmd.len() <= COMMAND_SIZE, "{} too long", cmd);
            assert!(is_known(cmd));
        }
    }
}
