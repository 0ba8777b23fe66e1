//! # Protocol Control Information
//! Defines the per-PDU header prepended by a normal IPCP to every SDU it
//! hands to an N-1 flow, and the extended header carried by control-only
//! PDUs. The layout is part of the wire contract between peer IPCPs.
#![deny(missing_docs)]
use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, BytesMut};
use std::io::{Error, ErrorKind, Result};

/// Data transfer PDU.
pub const PDU_T_DT: u16 = 0x8001;
/// Management PDU.
pub const PDU_T_MGMT: u16 = 0xC040;
/// Flow control only PDU.
pub const PDU_T_FC: u16 = 0xC001;

/// Data run flag, marks the first PDU of a new sending run.
pub const PDU_F_DRF: u8 = 0x01;

/// Length of the transfer PCI.
pub const HEADER_LEN: usize = 32;
/// Length of a control PDU, header plus control fields, no payload.
pub const CTRL_LEN: usize = HEADER_LEN + 40;

/// Transfer PCI:
///
/// ```text
/// 0               8               16
/// +---------------+---------------+
/// | dst_addr      | src_addr      |
/// +---+-----+-----+-----+---+-----+
/// |qos|d_cep|s_cep| type|flg|     |
/// +---+-----+-----+-----+---+     |
/// | seqnum                        |
/// +-------------------------------+
/// ```
///
/// All multi-byte fields are big endian.
#[derive(Clone)]
pub struct Pdu {
    data: BytesMut,
}

impl Pdu {
    /// Creates a transfer PDU around `payload`, header zeroed except type.
    pub fn dt(payload: &[u8]) -> Self {
        let mut data = BytesMut::with_capacity(HEADER_LEN + payload.len());
        data.put_bytes(0, HEADER_LEN);
        data.put_slice(payload);
        let mut pdu = Self { data };
        pdu.set_pdu_type(PDU_T_DT);
        pdu
    }

    /// Creates a management PDU around `payload`.
    pub fn mgmt(payload: &[u8]) -> Self {
        let mut pdu = Self::dt(payload);
        pdu.set_pdu_type(PDU_T_MGMT);
        pdu
    }

    /// Creates a control-only PDU (no payload, extended header).
    pub fn fc() -> CtrlPdu {
        let mut data = BytesMut::with_capacity(CTRL_LEN);
        data.put_bytes(0, CTRL_LEN);
        let mut pdu = Self { data };
        pdu.set_pdu_type(PDU_T_FC);
        CtrlPdu(pdu)
    }

    /// Parses a PDU received from a lower flow.
    pub fn parse(data: BytesMut) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(Error::new(ErrorKind::InvalidData, "truncated pci"));
        }
        let pdu = Self { data };
        match pdu.pdu_type() {
            PDU_T_DT | PDU_T_MGMT => Ok(pdu),
            PDU_T_FC if pdu.data.len() >= CTRL_LEN => Ok(pdu),
            PDU_T_FC => Err(Error::new(ErrorKind::InvalidData, "truncated control pci")),
            _ => Err(Error::new(ErrorKind::InvalidData, "unknown pdu type")),
        }
    }

    /// Destination address.
    pub fn dst_addr(&self) -> u64 {
        BigEndian::read_u64(&self.data[0..8])
    }

    /// Sets the destination address.
    pub fn set_dst_addr(&mut self, addr: u64) {
        BigEndian::write_u64(&mut self.data[0..8], addr);
    }

    /// Source address.
    pub fn src_addr(&self) -> u64 {
        BigEndian::read_u64(&self.data[8..16])
    }

    /// Sets the source address.
    pub fn set_src_addr(&mut self, addr: u64) {
        BigEndian::write_u64(&mut self.data[8..16], addr);
    }

    /// QoS id of the connection.
    pub fn qos_id(&self) -> u8 {
        self.data[16]
    }

    /// Sets the QoS id.
    pub fn set_qos_id(&mut self, qos_id: u8) {
        self.data[16] = qos_id;
    }

    /// Destination connection endpoint.
    pub fn dst_cep(&self) -> u16 {
        BigEndian::read_u16(&self.data[17..19])
    }

    /// Sets the destination connection endpoint.
    pub fn set_dst_cep(&mut self, cep: u16) {
        BigEndian::write_u16(&mut self.data[17..19], cep);
    }

    /// Source connection endpoint.
    pub fn src_cep(&self) -> u16 {
        BigEndian::read_u16(&self.data[19..21])
    }

    /// Sets the source connection endpoint.
    pub fn set_src_cep(&mut self, cep: u16) {
        BigEndian::write_u16(&mut self.data[19..21], cep);
    }

    /// PDU type.
    pub fn pdu_type(&self) -> u16 {
        BigEndian::read_u16(&self.data[21..23])
    }

    /// Sets the PDU type.
    pub fn set_pdu_type(&mut self, ty: u16) {
        BigEndian::write_u16(&mut self.data[21..23], ty);
    }

    /// PDU flags.
    pub fn pdu_flags(&self) -> u8 {
        self.data[23]
    }

    /// Sets the PDU flags.
    pub fn set_pdu_flags(&mut self, flags: u8) {
        self.data[23] = flags;
    }

    /// Data run flag.
    pub fn drf(&self) -> bool {
        self.pdu_flags() & PDU_F_DRF != 0
    }

    /// Sequence number.
    pub fn seqnum(&self) -> u64 {
        BigEndian::read_u64(&self.data[24..32])
    }

    /// Sets the sequence number.
    pub fn set_seqnum(&mut self, seqnum: u64) {
        BigEndian::write_u64(&mut self.data[24..32], seqnum);
    }

    /// The SDU carried by this PDU.
    pub fn payload(&self) -> &[u8] {
        &self.data[HEADER_LEN..]
    }

    /// Strips the PCI and returns the owned SDU.
    pub fn into_payload(mut self) -> BytesMut {
        let _ = self.data.split_to(HEADER_LEN);
        self.data
    }

    /// The whole PDU as transmitted.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the PDU, yielding the transmitted bytes.
    pub fn into_bytes(self) -> BytesMut {
        self.data
    }
}

impl std::fmt::Debug for Pdu {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("Pdu")
            .field("dst_addr", &self.dst_addr())
            .field("src_addr", &self.src_addr())
            .field("qos_id", &self.qos_id())
            .field("dst_cep", &self.dst_cep())
            .field("src_cep", &self.src_cep())
            .field("pdu_type", &format_args!("{:#06x}", self.pdu_type()))
            .field("drf", &self.drf())
            .field("seqnum", &self.seqnum())
            .field("payload", &self.payload().len())
            .finish()
    }
}

/// A control-only PDU. Wraps a `Pdu` and exposes the window edges carried
/// after the base header.
#[derive(Clone)]
pub struct CtrlPdu(Pdu);

impl CtrlPdu {
    /// Reinterprets a parsed PDU as a control PDU.
    ///
    /// `Pdu::parse` already guarantees the extended header is present for
    /// PDUs of type `PDU_T_FC`.
    pub fn from_pdu(pdu: Pdu) -> Result<Self> {
        if pdu.pdu_type() != PDU_T_FC {
            return Err(Error::new(ErrorKind::InvalidData, "not a control pdu"));
        }
        Ok(Self(pdu))
    }

    /// Last control sequence number received by the sender of this PDU.
    pub fn last_ctrl_seq_num_rcvd(&self) -> u64 {
        BigEndian::read_u64(&self.0.data[32..40])
    }

    /// Sets the last control sequence number received.
    pub fn set_last_ctrl_seq_num_rcvd(&mut self, v: u64) {
        BigEndian::write_u64(&mut self.0.data[32..40], v);
    }

    /// New right window edge granted to the peer.
    pub fn new_rwe(&self) -> u64 {
        BigEndian::read_u64(&self.0.data[40..48])
    }

    /// Sets the new right window edge.
    pub fn set_new_rwe(&mut self, v: u64) {
        BigEndian::write_u64(&mut self.0.data[40..48], v);
    }

    /// New left window edge of the sender of this PDU.
    pub fn new_lwe(&self) -> u64 {
        BigEndian::read_u64(&self.0.data[48..56])
    }

    /// Sets the new left window edge.
    pub fn set_new_lwe(&mut self, v: u64) {
        BigEndian::write_u64(&mut self.0.data[48..56], v);
    }

    /// Sender-side right window edge of the sender of this PDU.
    pub fn my_rwe(&self) -> u64 {
        BigEndian::read_u64(&self.0.data[56..64])
    }

    /// Sets the sender-side right window edge.
    pub fn set_my_rwe(&mut self, v: u64) {
        BigEndian::write_u64(&mut self.0.data[56..64], v);
    }

    /// Sender-side left window edge of the sender of this PDU.
    pub fn my_lwe(&self) -> u64 {
        BigEndian::read_u64(&self.0.data[64..72])
    }

    /// Sets the sender-side left window edge.
    pub fn set_my_lwe(&mut self, v: u64) {
        BigEndian::write_u64(&mut self.0.data[64..72], v);
    }

    /// Base header accessors.
    pub fn pdu(&self) -> &Pdu {
        &self.0
    }

    /// Mutable base header accessors.
    pub fn pdu_mut(&mut self) -> &mut Pdu {
        &mut self.0
    }

    /// Consumes the control PDU, yielding the transmitted bytes.
    pub fn into_bytes(self) -> BytesMut {
        self.0.data
    }
}

impl std::fmt::Debug for CtrlPdu {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("CtrlPdu")
            .field("dst_cep", &self.0.dst_cep())
            .field("src_cep", &self.0.src_cep())
            .field("seqnum", &self.0.seqnum())
            .field("last_ctrl_seq_num_rcvd", &self.last_ctrl_seq_num_rcvd())
            .field("new_rwe", &self.new_rwe())
            .field("new_lwe", &self.new_lwe())
            .field("my_rwe", &self.my_rwe())
            .field("my_lwe", &self.my_lwe())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dt_roundtrip() {
        let mut pdu = Pdu::dt(b"hello");
        pdu.set_dst_addr(42);
        pdu.set_src_addr(7);
        pdu.set_dst_cep(100);
        pdu.set_src_cep(200);
        pdu.set_pdu_flags(PDU_F_DRF);
        pdu.set_seqnum(5);

        let bytes = BytesMut::from(pdu.bytes());
        let parsed = Pdu::parse(bytes).unwrap();
        assert_eq!(parsed.dst_addr(), 42);
        assert_eq!(parsed.src_addr(), 7);
        assert_eq!(parsed.qos_id(), 0);
        assert_eq!(parsed.dst_cep(), 100);
        assert_eq!(parsed.src_cep(), 200);
        assert_eq!(parsed.pdu_type(), PDU_T_DT);
        assert!(parsed.drf());
        assert_eq!(parsed.seqnum(), 5);
        assert_eq!(parsed.payload(), b"hello");
        assert_eq!(&parsed.into_payload()[..], b"hello");
    }

    #[test]
    fn test_fc_roundtrip() {
        let mut fc = Pdu::fc();
        fc.pdu_mut().set_dst_cep(1);
        fc.pdu_mut().set_seqnum(9);
        fc.set_last_ctrl_seq_num_rcvd(3);
        fc.set_new_rwe(64);
        fc.set_new_lwe(10);
        fc.set_my_rwe(32);
        fc.set_my_lwe(8);

        let parsed = Pdu::parse(fc.into_bytes()).unwrap();
        assert_eq!(parsed.pdu_type(), PDU_T_FC);
        let ctrl = CtrlPdu::from_pdu(parsed).unwrap();
        assert_eq!(ctrl.pdu().seqnum(), 9);
        assert_eq!(ctrl.last_ctrl_seq_num_rcvd(), 3);
        assert_eq!(ctrl.new_rwe(), 64);
        assert_eq!(ctrl.new_lwe(), 10);
        assert_eq!(ctrl.my_rwe(), 32);
        assert_eq!(ctrl.my_lwe(), 8);
    }

    #[test]
    fn test_parse_errors() {
        assert!(Pdu::parse(BytesMut::from(&b"short"[..])).is_err());

        let mut bogus = Pdu::dt(b"");
        bogus.set_pdu_type(0x1234);
        assert!(Pdu::parse(bogus.into_bytes()).is_err());

        // A control PDU truncated to the base header is rejected.
        let mut fc = Pdu::dt(b"");
        fc.set_pdu_type(PDU_T_FC);
        assert!(Pdu::parse(fc.into_bytes()).is_err());
    }

    #[test]
    fn test_mgmt() {
        let pdu = Pdu::mgmt(b"rib");
        assert_eq!(pdu.pdu_type(), PDU_T_MGMT);
        let parsed = Pdu::parse(pdu.into_bytes()).unwrap();
        assert_eq!(parsed.payload(), b"rib");
    }
}
