use crate::can::Frame;
use crate::can::Identifier;
use crate::can::DLC_TO_LEN;
use crate::error::Error;

pub const CANPACKET_HEAD_SIZE: usize = 0x6;
const CANPACKET_MAX_CHUNK_SIZE: usize = 256;

// Header layout

//  byte 0
//   unsigned char fd : 1;
//   unsigned char bus : 3;
//   unsigned char data_len_code : 4;  // lookup length with dlc_to_len

// byte 1, 2, 3, 4
//   unsigned char rejected : 1;
//   unsigned char returned : 1;
//   unsigned char extended : 1;
//   unsigned int addr : 29;

// byte 5
//   unsigned char checksum;

// byte 6
//   unsigned char data[CANPACKET_DATA_SIZE_MAX];
// }

pub fn calculate_checksum(dat: &[u8]) -> u8 {
    dat.iter().fold(0, |acc, &x| acc ^ x)
}

/// Pack frames into chunks for the CAN bulk OUT endpoint. A new chunk is started once a chunk exceeds 256 bytes.
pub fn pack_can_buffer(frames: &[Frame]) -> Result<Vec<Vec<u8>>, Error> {
    let mut ret: Vec<Vec<u8>> = vec![vec![]];

    for frame in frames {
        let id: u32 = frame.id.into();

        // Check if the id is valid
        match frame.id {
            Identifier::Standard(id) if id > 0x7ff => return Err(Error::MalformedFrame),
            Identifier::Extended(id) if id > 0x1fffffff => return Err(Error::MalformedFrame),
            _ => {}
        }
        if frame.bus > 0b111 {
            return Err(Error::MalformedFrame);
        }

        let dlc = DLC_TO_LEN.iter().position(|&x| x == frame.data.len());
        let dlc = dlc.ok_or(Error::MalformedFrame)? as u8;

        // The firmware decides on the address, not on how the caller spelled the identifier
        let extended: u32 = (id >= 0x800) as u32;
        let word_4b: u32 = (id << 3) | (extended << 2);

        let header: [u8; CANPACKET_HEAD_SIZE - 1] = [
            (dlc << 4) | (frame.bus << 1),
            (word_4b & 0xff) as u8,
            ((word_4b >> 8) & 0xff) as u8,
            ((word_4b >> 16) & 0xff) as u8,
            ((word_4b >> 24) & 0xff) as u8,
        ];

        let checksum = calculate_checksum(&header) ^ calculate_checksum(&frame.data);

        if ret.last().is_some_and(|last| last.len() > CANPACKET_MAX_CHUNK_SIZE) {
            ret.push(vec![]);
        }

        if let Some(last) = ret.last_mut() {
            last.extend_from_slice(&header);
            last.push(checksum);
            last.extend_from_slice(&frame.data);
        }
    }

    ret.retain(|chunk| !chunk.is_empty());
    Ok(ret)
}

/// Unpack all complete frames at the start of `dat`. Whatever is left of a partial frame stays in `dat`
/// so it can be prepended to the next read.
pub fn unpack_can_buffer(dat: &mut Vec<u8>) -> Result<Vec<Frame>, Error> {
    let mut ret = vec![];
    let mut pos = 0;

    while dat.len() - pos >= CANPACKET_HEAD_SIZE {
        let head = &dat[pos..pos + CANPACKET_HEAD_SIZE];

        let bus = (head[0] >> 1) & 0b111;
        let dlc = (head[0] >> 4) & 0b1111;
        let word_4b = u32::from_le_bytes([head[1], head[2], head[3], head[4]]);

        let extended: bool = (word_4b & 0b100) != 0;
        let returned: bool = (word_4b & 0b010) != 0;
        let rejected: bool = (word_4b & 0b001) != 0;

        // Check if we have enough data to unpack the whole frame
        let data_len = DLC_TO_LEN[dlc as usize];
        if data_len > dat.len() - pos - CANPACKET_HEAD_SIZE {
            break;
        }

        let end = pos + CANPACKET_HEAD_SIZE + data_len;
        if calculate_checksum(&dat[pos..end]) != 0 {
            return Err(Error::PandaError(
                crate::panda::error::Error::InvalidChecksum,
            ));
        }

        let id = match extended {
            true => Identifier::Extended((word_4b >> 3) & 0x1fffffff),
            false => Identifier::Standard((word_4b >> 3) & 0x7ff),
        };

        ret.push(Frame {
            id,
            bus,
            data: dat[pos + CANPACKET_HEAD_SIZE..end].to_vec(),
            loopback: returned,
            rejected,
            fd: data_len > 8,
        });

        pos = end;
    }

    dat.drain(..pos);
    Ok(ret)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unpack_single() {
        let mut buffer = vec![
            208, 128, 1, 0, 0, 171, 0, 0, 0, 0, 0, 0, 13, 69, 0, 0, 8, 0, 0, 27, 0, 0, 0, 0, 0, 1,
            0, 0, 255, 250, 0, 0, 0, 0, 199, 116, 151, 129,
        ];
        let frames = unpack_can_buffer(&mut buffer).unwrap();

        // All data is consumed
        assert_eq!(buffer.len(), 0);

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id, Identifier::Standard(48));
        assert_eq!(frames[0].bus, 0);
        assert!(frames[0].fd);
        assert_eq!(
            frames[0].data,
            vec![
                0, 0, 0, 0, 0, 0, 13, 69, 0, 0, 8, 0, 0, 27, 0, 0, 0, 0, 0, 1, 0, 0, 255, 250, 0,
                0, 0, 0, 199, 116, 151, 129
            ]
        );
    }

    #[test]
    fn test_remaining_data() {
        let mut buffer = vec![
            208, 128, 1, 0, 0, 171, 0, 0, 0, 0, 0, 0, 13, 69, 0, 0, 8, 0, 0, 27, 0, 0, 0, 0, 0, 1,
            0, 0, 255, 250, 0, 0, 0, 0, 199, 116, 151, 129, // Extra
            208, 128,
        ];

        unpack_can_buffer(&mut buffer).unwrap();
        assert_eq!(buffer, vec![208, 128]);
    }

    #[test]
    fn test_pack_classic() {
        let frame = Frame::new(0, 0x7df.into(), &[0x02, 0x10, 0x03, 0, 0, 0, 0, 0]).unwrap();
        let chunks = pack_can_buffer(&[frame]).unwrap();

        assert_eq!(chunks.len(), 1);
        let chunk = &chunks[0];
        assert_eq!(chunk.len(), 14);
        assert_eq!(chunk[0] >> 4, 8);
        assert_eq!(chunk[1] & 0b100, 0);
        assert_eq!(calculate_checksum(chunk), 0);
    }

    #[test]
    fn test_pack_extended() {
        let frame = Frame::new(1, 0x18db33f1.into(), &[0x02, 0x10, 0x03]).unwrap();
        let chunks = pack_can_buffer(&[frame]).unwrap();

        assert_eq!(chunks.len(), 1);
        let chunk = &chunks[0];
        assert_eq!(chunk.len(), 9);
        assert_eq!(chunk[0] >> 4, 3);
        assert_eq!((chunk[0] >> 1) & 0b111, 0b001);
        assert_eq!(chunk[1] & 0b100, 0b100);
        assert_eq!(calculate_checksum(chunk), 0);

        let word = u32::from_le_bytes([chunk[1], chunk[2], chunk[3], chunk[4]]);
        assert_eq!(word >> 3, 0x18db33f1);
    }

    #[test]
    fn test_extended_flag_follows_address() {
        let frames = vec![
            Frame::new(0, Identifier::Extended(0x123), &[1]).unwrap(),
            Frame::new(0, Identifier::Extended(0x800), &[1]).unwrap(),
        ];
        let chunks = pack_can_buffer(&frames).unwrap();
        let buffer = chunks.concat();
        assert_eq!(buffer[1] & 0b100, 0);
        assert_eq!(buffer[7 + 1] & 0b100, 0b100);
    }

    #[test]
    fn test_unpack_returned() {
        let frame = Frame::new(0, 0x7df.into(), &[0x02, 0x10, 0x03, 0, 0, 0, 0, 0]).unwrap();
        let mut buffer = pack_can_buffer(&[frame]).unwrap().concat();

        // Set the returned bit and fix up the checksum
        buffer[1] |= 0b010;
        buffer[5] ^= 0b010;

        let frames = unpack_can_buffer(&mut buffer).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].loopback);
        assert_eq!(frames[0].record_bus(), 128);
        assert_eq!(frames[0].to_record().3, 128);
    }

    #[test]
    fn test_unpack_rejected() {
        let frame = Frame::new(2, 0x123.into(), &[1, 2]).unwrap();
        let mut buffer = pack_can_buffer(&[frame]).unwrap().concat();

        buffer[1] |= 0b001;
        buffer[5] ^= 0b001;

        let frames = unpack_can_buffer(&mut buffer).unwrap();
        assert!(frames[0].rejected);
        assert_eq!(frames[0].record_bus(), 194);
    }

    #[test]
    fn test_bad_checksum() {
        let frame = Frame::new(0, 0x123.into(), &[1, 2, 3, 4]).unwrap();
        let mut buffer = pack_can_buffer(&[frame]).unwrap().concat();
        buffer[6] ^= 0xff;

        let r = unpack_can_buffer(&mut buffer);
        assert_eq!(
            r,
            Err(Error::PandaError(crate::panda::error::Error::InvalidChecksum))
        );
    }

    #[test]
    fn test_round_trip() {
        let frames = vec![
            Frame::new(0, Identifier::Standard(0x123), &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap(),
            Frame::new(1, Identifier::Extended(0x1234), &[1, 2, 3, 4]).unwrap(),
            Frame::new(2, Identifier::Standard(0x7ff), &[]).unwrap(),
            Frame::new(3, Identifier::Extended(0x1fffffff), &[0xaa; 64]).unwrap(),
        ];

        let buffer = pack_can_buffer(&frames).unwrap();
        let mut buffer = buffer.concat();
        let unpacked = unpack_can_buffer(&mut buffer).unwrap();

        assert_eq!(frames, unpacked);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_split_frames() {
        let r1 = Frame::new(0, 0x7df.into(), &[0x02, 0x10, 0x03, 0, 0, 0, 0, 0]).unwrap();
        let r2 = Frame::new(1, 0x18db33f1.into(), &[0x02, 0x10, 0x03]).unwrap();
        let b = pack_can_buffer(&[r1.clone(), r2.clone()]).unwrap().concat();

        for k in 0..b.len() {
            let mut rem = b[..k].to_vec();
            let mut frames = unpack_can_buffer(&mut rem).unwrap();

            rem.extend_from_slice(&b[k..]);
            frames.extend(unpack_can_buffer(&mut rem).unwrap());

            assert_eq!(frames, vec![r1.clone(), r2.clone()], "split at {}", k);
            assert!(rem.is_empty());
        }
    }

    #[test]
    fn test_chunking() {
        let frames: Vec<Frame> = (0..20)
            .map(|i| Frame::new(0, Identifier::Standard(i), &[i as u8; 64]).unwrap())
            .collect();
        let chunks = pack_can_buffer(&frames).unwrap();

        // 70 byte frames, a chunk is closed once it grows past 256 bytes
        assert_eq!(chunks.len(), 5);
        assert!(chunks.iter().all(|c| c.len() == 4 * 70));
        assert!(chunks.iter().all(|c| !c.is_empty()));

        let mut buffer = chunks.concat();
        assert_eq!(unpack_can_buffer(&mut buffer).unwrap(), frames);
    }

    #[test]
    fn test_round_malformed_dlc() {
        let frames = vec![Frame {
            bus: 0,
            id: Identifier::Standard(0x123),
            data: vec![1, 2, 3, 4, 5, 6, 7, 8, 9],
            loopback: false,
            rejected: false,
            fd: true,
        }];
        let r = pack_can_buffer(&frames);
        assert_eq!(r, Err(Error::MalformedFrame));
    }

    #[test]
    fn test_round_malformed_id() {
        let frames = vec![Frame {
            bus: 0,
            id: Identifier::Standard(0xfff),
            data: vec![1, 2, 3, 4, 5, 6, 7, 8],
            loopback: false,
            rejected: false,
            fd: false,
        }];
        let r = pack_can_buffer(&frames);
        assert_eq!(r, Err(Error::MalformedFrame));
    }

    #[test]
    fn test_empty() {
        assert_eq!(pack_can_buffer(&[]).unwrap(), Vec::<Vec<u8>>::new());
        let mut buffer = vec![];
        assert!(unpack_can_buffer(&mut buffer).unwrap().is_empty());
    }
}
