use std::io::{Read, Seek};

use crate::error::ClfsError;

pub mod base;
pub mod blf;
pub mod block;
pub mod container;
pub mod control;
pub mod error;
pub mod lsn;
pub mod parse_utils;
pub mod signatures;
pub mod truncate;

#[cfg(test)]
pub(crate) mod fixtures;

pub trait DeSerialise<T> {
    type Item;

    fn deserialize(reader: &mut T) -> Result<Self::Item, ClfsError>
    where
        T: Read + Seek;
}
