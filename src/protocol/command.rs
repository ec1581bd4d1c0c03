use super::error::ProtocolError;

/// Command types. Odd values are requests, the following even value is the
/// matching response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u16)]
pub enum Command {
    FindPeerReq = 0x51,
    FindPeerResp = 0x52,
    UpdateValueReq = 0x53,
    UpdateValueResp = 0x54,
    FindValueReq = 0x55,
    FindValueResp = 0x56,
    PingReq = 0x57,
    PingResp = 0x58,
    HandshakeReq = 0x59,
    HandshakeResp = 0x5A,
    HoleCallReq = 0x5B,
    HoleCallResp = 0x5C,
    HoleCalledReq = 0x5D,
    HoleCalledResp = 0x5E,
    BroadcastEventReq = 0x5F,
    BroadcastEventResp = 0x60,
    PackagePieceReq = 0x61,
    PackagePieceResp = 0x62,
    CombinePackage = 0x63,
}

impl Command {
    pub const ALL: [Command; 19] = [
        Command::FindPeerReq,
        Command::FindPeerResp,
        Command::UpdateValueReq,
        Command::UpdateValueResp,
        Command::FindValueReq,
        Command::FindValueResp,
        Command::PingReq,
        Command::PingResp,
        Command::HandshakeReq,
        Command::HandshakeResp,
        Command::HoleCallReq,
        Command::HoleCallResp,
        Command::HoleCalledReq,
        Command::HoleCalledResp,
        Command::BroadcastEventReq,
        Command::BroadcastEventResp,
        Command::PackagePieceReq,
        Command::PackagePieceResp,
        Command::CombinePackage,
    ];

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn is_resp(self) -> bool {
        self.as_u16() & 1 == 0
    }

    /// The response command answering this request.
    pub fn response(self) -> Option<Command> {
        if self.is_resp() || self == Command::CombinePackage {
            return None;
        }
        Command::try_from(self.as_u16() + 1).ok()
    }

    /// Packages of these commands carry no common section.
    pub fn is_bare(self) -> bool {
        matches!(self, Command::PackagePieceReq | Command::CombinePackage)
    }
}

impl TryFrom<u16> for Command {
    type Error = ProtocolError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Command::ALL
            .iter()
            .copied()
            .find(|c| c.as_u16() == value)
            .ok_or(ProtocolError::UnknownCommand(value))
    }
}
