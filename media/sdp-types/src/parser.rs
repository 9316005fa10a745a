use crate::parse::{IResult, error_context};
use crate::{
    Bandwidth, Connection, Direction, Fingerprint, Fmtp, Group, IceCandidate, IceOptions,
    IcePassword, IceUsernameFragment, Media, MediaDescription, Origin, Rtcp, RtcpFeedback, RtpMap,
    SessionDescription, Setup, Ssrc, Time, UnknownAttribute,
};
use bytesstr::BytesStr;
use nom::Finish;

#[derive(Debug, thiserror::Error)]
pub enum ParseSessionDescriptionError {
    #[error("invalid line {line:?}: {context}")]
    InvalidLine { line: String, context: &'static str },
    #[error("message ended unexpectedly")]
    Incomplete,
    #[error("message is missing the origin field (o=)")]
    MissingOrigin,
    #[error("message is missing the name (s=) field")]
    MissingName,
    #[error("message is missing the time (t=) field")]
    MissingTime,
}

impl ParseSessionDescriptionError {
    fn invalid(line: &str, context: &'static str) -> Self {
        Self::InvalidLine {
            line: line.into(),
            context,
        }
    }
}

/// Finish a field parser, mapping the error to the line it failed on
fn finish<'i, T>(line: &'i str, result: IResult<&'i str, T>) -> Result<T, ParseSessionDescriptionError> {
    result
        .finish()
        .map(|(_, value)| value)
        .map_err(|e| ParseSessionDescriptionError::invalid(line, error_context(&e)))
}

#[derive(Default)]
pub(crate) struct Parser {
    origin: Option<Origin>,
    name: Option<BytesStr>,
    connection: Option<Connection>,
    bandwidth: Vec<Bandwidth>,
    time: Option<Time>,
    direction: Direction,
    group: Vec<Group>,
    ice_options: IceOptions,
    ice_lite: bool,
    ice_ufrag: Option<IceUsernameFragment>,
    ice_pwd: Option<IcePassword>,
    ice_end_of_candidates: bool,
    fingerprint: Vec<Fingerprint>,
    setup: Option<Setup>,
    attributes: Vec<UnknownAttribute>,
    media_descriptions: Vec<MediaDescription>,
}

impl Parser {
    pub(crate) fn parse_line(
        &mut self,
        src: &BytesStr,
        complete_line: &str,
    ) -> Result<(), ParseSessionDescriptionError> {
        let complete_line = complete_line.trim_end();

        let line = complete_line
            .get(2..)
            .ok_or(ParseSessionDescriptionError::Incomplete)?;

        match complete_line.as_bytes() {
            [b'v', b'=', b'0'] => {}
            [b'v', b'=', ..] => {
                return Err(ParseSessionDescriptionError::invalid(
                    complete_line,
                    "unsupported version",
                ));
            }
            [b's', b'=', ..] => {
                self.name = Some(BytesStr::from_parse(src.as_ref(), line));
            }
            [b'o', b'=', ..] => {
                self.origin = Some(finish(complete_line, Origin::parse(src.as_ref(), line))?);
            }
            [b't', b'=', ..] => {
                self.time = Some(finish(complete_line, Time::parse(line))?);
            }
            [b'c', b'=', ..] => {
                let c = finish(complete_line, Connection::parse(src.as_ref(), line))?;

                if let Some(media_description) = self.media_descriptions.last_mut() {
                    media_description.connection = Some(c);
                } else {
                    self.connection = Some(c);
                }
            }
            [b'b', b'=', ..] => {
                let b = finish(complete_line, Bandwidth::parse(src.as_ref(), line))?;

                if let Some(media_description) = self.media_descriptions.last_mut() {
                    media_description.bandwidth.push(b);
                } else {
                    self.bandwidth.push(b);
                }
            }
            [b'm', b'=', ..] => {
                let media = finish(complete_line, Media::parse(src.as_ref(), line))?;

                let mut media_description = MediaDescription::new(media);

                // inherit session direction
                media_description.direction = self.direction;

                self.media_descriptions.push(media_description);
            }
            [b'a', b'=', ..] => self.parse_attribute(src, complete_line, line)?,
            _ => {}
        }

        Ok(())
    }

    fn parse_attribute(
        &mut self,
        src: &BytesStr,
        complete_line: &str,
        line: &str,
    ) -> Result<(), ParseSessionDescriptionError> {
        if let Some((name, value)) = line.split_once(':') {
            self.parse_attribute_with_value(src, complete_line, name, value)
        } else {
            self.parse_attribute_without_value(src, line);
            Ok(())
        }
    }

    fn parse_attribute_with_value(
        &mut self,
        src: &BytesStr,
        complete_line: &str,
        name: &str,
        value: &str,
    ) -> Result<(), ParseSessionDescriptionError> {
        let bytes = src.as_ref();
        let media_description = self.media_descriptions.last_mut();

        match (name, media_description) {
            ("group", _) => {
                self.group
                    .push(finish(complete_line, Group::parse(bytes, value))?);
            }
            ("ice-options", _) => {
                self.ice_options = finish(complete_line, IceOptions::parse(bytes, value))?;
            }
            ("ice-ufrag", media_description) => {
                let ufrag = finish(complete_line, IceUsernameFragment::parse(bytes, value))?;

                match media_description {
                    Some(media_description) => media_description.ice_ufrag = Some(ufrag),
                    None => self.ice_ufrag = Some(ufrag),
                }
            }
            ("ice-pwd", media_description) => {
                let pwd = finish(complete_line, IcePassword::parse(bytes, value))?;

                match media_description {
                    Some(media_description) => media_description.ice_pwd = Some(pwd),
                    None => self.ice_pwd = Some(pwd),
                }
            }
            ("fingerprint", media_description) => {
                let fingerprint = finish(complete_line, Fingerprint::parse(bytes, value))?;

                match media_description {
                    Some(media_description) => media_description.fingerprint.push(fingerprint),
                    None => self.fingerprint.push(fingerprint),
                }
            }
            ("setup", media_description) => {
                let setup = Setup::parse(value).ok_or_else(|| {
                    ParseSessionDescriptionError::invalid(complete_line, "parsing setup")
                })?;

                match media_description {
                    Some(media_description) => media_description.setup = Some(setup),
                    None => self.setup = Some(setup),
                }
            }
            ("rtcp", Some(media_description)) => {
                media_description.rtcp = Some(finish(complete_line, Rtcp::parse(bytes, value))?);
            }
            ("mid", Some(media_description)) => {
                media_description.mid = Some(BytesStr::from_parse(bytes, value.trim()));
            }
            ("rtpmap", Some(media_description)) => {
                media_description
                    .rtpmap
                    .push(finish(complete_line, RtpMap::parse(bytes, value))?);
            }
            ("fmtp", Some(media_description)) => {
                media_description
                    .fmtp
                    .push(finish(complete_line, Fmtp::parse(bytes, value))?);
            }
            ("rtcp-fb", Some(media_description)) => {
                media_description
                    .rtcp_fb
                    .push(finish(complete_line, RtcpFeedback::parse(bytes, value))?);
            }
            ("candidate", Some(media_description)) => {
                media_description
                    .ice_candidates
                    .push(finish(complete_line, IceCandidate::parse(bytes, value))?);
            }
            ("ssrc", Some(media_description)) => {
                media_description
                    .ssrc
                    .push(finish(complete_line, Ssrc::parse(bytes, value))?);
            }
            ("sctp-port", Some(media_description)) => {
                let port = value.trim().parse().map_err(|_| {
                    ParseSessionDescriptionError::invalid(complete_line, "parsing sctp-port")
                })?;

                media_description.sctp_port = Some(port);
            }
            (_, media_description) => {
                let attr = UnknownAttribute {
                    name: BytesStr::from_parse(bytes, name),
                    value: Some(BytesStr::from_parse(bytes, value)),
                };

                match media_description {
                    Some(media_description) => media_description.attributes.push(attr),
                    None => self.attributes.push(attr),
                }
            }
        }

        Ok(())
    }

    fn parse_attribute_without_value(&mut self, src: &BytesStr, name: &str) {
        let media_description = self.media_descriptions.last_mut();

        if let Some(direction) = Direction::from_attribute(name) {
            match media_description {
                Some(media_description) => media_description.direction = direction,
                None => self.direction = direction,
            }

            return;
        }

        match (name, media_description) {
            ("ice-lite", _) => self.ice_lite = true,
            ("end-of-candidates", Some(media_description)) => {
                media_description.ice_end_of_candidates = true;
            }
            ("end-of-candidates", None) => self.ice_end_of_candidates = true,
            ("rtcp-mux", Some(media_description)) => media_description.rtcp_mux = true,
            (_, media_description) => {
                let attr = UnknownAttribute {
                    name: BytesStr::from_parse(src.as_ref(), name),
                    value: None,
                };

                match media_description {
                    Some(media_description) => media_description.attributes.push(attr),
                    None => self.attributes.push(attr),
                }
            }
        }
    }

    pub(crate) fn finish(self) -> Result<SessionDescription, ParseSessionDescriptionError> {
        Ok(SessionDescription {
            origin: self
                .origin
                .ok_or(ParseSessionDescriptionError::MissingOrigin)?,
            name: self.name.ok_or(ParseSessionDescriptionError::MissingName)?,
            connection: self.connection,
            bandwidth: self.bandwidth,
            time: self.time.ok_or(ParseSessionDescriptionError::MissingTime)?,
            direction: self.direction,
            group: self.group,
            ice_lite: self.ice_lite,
            ice_options: self.ice_options,
            ice_ufrag: self.ice_ufrag,
            ice_pwd: self.ice_pwd,
            ice_end_of_candidates: self.ice_end_of_candidates,
            fingerprint: self.fingerprint,
            setup: self.setup,
            attributes: self.attributes,
            media_descriptions: self.media_descriptions,
        })
    }
}
