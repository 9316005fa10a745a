use crate::attributes::Group;
use crate::bandwidth::Bandwidth;
use crate::connection::Connection;
use crate::origin::Origin;
use crate::parser::{ParseSessionDescriptionError, Parser};
use crate::time::Time;
use crate::{
    Direction, Fingerprint, IceOptions, IcePassword, IceUsernameFragment, MediaDescription, Setup,
    UnknownAttribute,
};
use bytesstr::BytesStr;
use std::fmt;

/// The Session Description message. Can be serialized to valid SDP using the [`fmt::Display`] implementation and
/// parse SDP using [`SessionDescription::parse`].
#[derive(Debug, Clone)]
pub struct SessionDescription {
    /// Origin (o field)
    pub origin: Origin,

    /// The name of the sdp session (s field)
    pub name: BytesStr,

    /// Optional connection (c field)
    pub connection: Option<Connection>,

    /// Bandwidth (b field)
    pub bandwidth: Vec<Bandwidth>,

    /// Session start/stop time (t field)
    pub time: Time,

    /// Global session media direction attribute
    pub direction: Direction,

    /// Media groups (a=group)
    pub group: Vec<Group>,

    /// If specified an ice-lite implementation is used
    pub ice_lite: bool,

    /// ICE options, omitted if empty
    pub ice_options: IceOptions,

    /// ICE username fragment, default for all media descriptions
    pub ice_ufrag: Option<IceUsernameFragment>,

    /// ICE password, default for all media descriptions
    pub ice_pwd: Option<IcePassword>,

    /// Session level `a=end-of-candidates`
    pub ice_end_of_candidates: bool,

    /// Session level DTLS certificate fingerprints, default for all media descriptions
    pub fingerprint: Vec<Fingerprint>,

    /// Session level DTLS setup role, default for all media descriptions
    pub setup: Option<Setup>,

    /// All attributes not parsed directly
    pub attributes: Vec<UnknownAttribute>,

    /// Media descriptions
    pub media_descriptions: Vec<MediaDescription>,
}

impl SessionDescription {
    pub fn parse(src: &BytesStr) -> Result<Self, ParseSessionDescriptionError> {
        let lines = src.split(['\n', '\r']).filter(|line| !line.trim().is_empty());

        let mut parser = Parser::default();

        for complete_line in lines {
            parser.parse_line(src, complete_line)?;
        }

        parser.finish()
    }

    /// Returns the mids of the first BUNDLE group
    pub fn bundle(&self) -> Option<&[BytesStr]> {
        self.group
            .iter()
            .find(|group| group.is_bundle())
            .map(|group| group.mids.as_slice())
    }

    /// Returns if an `a=end-of-candidates` is present at session or any media level
    pub fn has_end_of_candidates(&self) -> bool {
        self.ice_end_of_candidates
            || self
                .media_descriptions
                .iter()
                .any(|desc| desc.ice_end_of_candidates)
    }

    /// ICE credentials of the media description, falling back to the session level
    pub fn ice_credentials(&self, desc: &MediaDescription) -> Option<(BytesStr, BytesStr)> {
        let ufrag = desc.ice_ufrag.as_ref().or(self.ice_ufrag.as_ref())?;
        let pwd = desc.ice_pwd.as_ref().or(self.ice_pwd.as_ref())?;

        Some((ufrag.ufrag.clone(), pwd.pwd.clone()))
    }

    /// DTLS fingerprint of the media description, falling back to the session level
    pub fn fingerprint<'a>(&'a self, desc: &'a MediaDescription) -> Option<&'a Fingerprint> {
        desc.fingerprint.first().or(self.fingerprint.first())
    }

    /// DTLS setup role of the media description, falling back to the session level
    pub fn setup(&self, desc: &MediaDescription) -> Option<Setup> {
        desc.setup.or(self.setup)
    }
}

impl fmt::Display for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("v=0\r\n")?;
        write!(f, "o={}\r\n", self.origin)?;
        write!(f, "s={}\r\n", self.name)?;

        if let Some(conn) = &self.connection {
            write!(f, "c={conn}\r\n")?;
        }

        for bw in &self.bandwidth {
            write!(f, "b={bw}\r\n")?;
        }

        write!(f, "t={}\r\n", self.time)?;

        // direction is written in every media description instead

        for group in &self.group {
            write!(f, "a=group:{group}\r\n")?;
        }

        if !self.ice_options.options.is_empty() {
            write!(f, "a=ice-options:{}\r\n", self.ice_options)?;
        }

        if self.ice_lite {
            f.write_str("a=ice-lite\r\n")?;
        }

        if let Some(ufrag) = &self.ice_ufrag {
            write!(f, "a=ice-ufrag:{}\r\n", ufrag.ufrag)?;
        }

        if let Some(pwd) = &self.ice_pwd {
            write!(f, "a=ice-pwd:{}\r\n", pwd.pwd)?;
        }

        for fingerprint in &self.fingerprint {
            write!(f, "a=fingerprint:{fingerprint}\r\n")?;
        }

        if let Some(setup) = self.setup {
            write!(f, "a=setup:{setup}\r\n")?;
        }

        for attr in &self.attributes {
            write!(f, "a={attr}\r\n")?;
        }

        for media_description in &self.media_descriptions {
            write!(f, "{media_description}")?;
        }

        if self.ice_end_of_candidates && self.media_descriptions.is_empty() {
            f.write_str("a=end-of-candidates\r\n")?;
        }

        Ok(())
    }
}
