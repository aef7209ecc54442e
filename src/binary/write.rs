#![deny(missing_docs)]

//! Write binary data

use std::iter;

use crate::binary::{I16Be, I32Be, U16Be, U24Be, U32Be, U8};
use crate::error::WriteError;

/// An in-memory buffer that implements `WriteContext`.
pub struct WriteBuffer {
    data: Vec<u8>,
}

/// A `WriteContext` implementation that just counts the bytes written.
pub struct WriteCounter {
    count: usize,
}

/// Trait that describes a type that can be written to a `WriteContext` in binary form.
pub trait WriteBinary<HostType = Self> {
    /// The type of the value returned by `write`.
    type Output;

    /// Write the binary representation of Self to `ctxt`.
    fn write<C: WriteContext>(ctxt: &mut C, val: HostType) -> Result<Self::Output, WriteError>;
}

/// Trait that describes a type that can be written to a `WriteContext` in binary form with
/// dependent arguments.
pub trait WriteBinaryDep<HostType = Self> {
    /// The type of the arguments supplied to `write_dep`.
    type Args;
    /// The type of the value returned by `write_dep`.
    type Output;

    /// Write the binary representation of Self to `ctxt`.
    fn write_dep<C: WriteContext>(
        ctxt: &mut C,
        val: HostType,
        args: Self::Args,
    ) -> Result<Self::Output, WriteError>;
}

/// Trait for types that can have binary data written to them.
pub trait WriteContext {
    /// Write a slice of values into a `WriteContext`.
    fn write_iter<T, HostType>(
        &mut self,
        iter: impl Iterator<Item = HostType>,
    ) -> Result<(), WriteError>
    where
        Self: Sized,
        T: WriteBinary<HostType>,
    {
        for val in iter {
            T::write(self, val)?;
        }

        Ok(())
    }

    /// Write a slice of bytes to a `WriteContext`.
    fn write_bytes(&mut self, data: &[u8]) -> Result<(), WriteError>;

    /// Write the specified number of zero bytes to the `WriteContext`.
    fn write_zeros(&mut self, count: usize) -> Result<(), WriteError>;

    /// The total number of bytes written so far.
    fn bytes_written(&self) -> usize;
}

/// Write `T` into a `WriteBuffer` and return it
pub fn buffer<HostType, T: WriteBinaryDep<HostType>>(
    writeable: HostType,
    args: T::Args,
) -> Result<(T::Output, WriteBuffer), WriteError> {
    let mut buffer = WriteBuffer::new();
    let output = T::write_dep(&mut buffer, writeable, args)?;
    Ok((output, buffer))
}

/// Calculate the number of bytes `T` occupies when written, without writing it anywhere
pub fn size<HostType, T: WriteBinaryDep<HostType>>(
    writeable: HostType,
    args: T::Args,
) -> Result<usize, WriteError> {
    let mut counter = WriteCounter::new();
    T::write_dep(&mut counter, writeable, args)?;
    Ok(counter.bytes_written())
}

impl<T, HostType> WriteBinaryDep<HostType> for T
where
    T: WriteBinary<HostType>,
{
    type Args = ();
    type Output = T::Output;

    fn write_dep<C: WriteContext>(
        ctxt: &mut C,
        val: HostType,
        (): Self::Args,
    ) -> Result<Self::Output, WriteError> {
        T::write(ctxt, val)
    }
}

impl<T> WriteBinary<T> for U8
where
    T: Into<u8>,
{
    type Output = ();

    fn write<C: WriteContext>(ctxt: &mut C, t: T) -> Result<(), WriteError> {
        let val: u8 = t.into();
        ctxt.write_bytes(&[val])
    }
}

impl<T> WriteBinary<T> for I16Be
where
    T: Into<i16>,
{
    type Output = ();

    fn write<C: WriteContext>(ctxt: &mut C, t: T) -> Result<(), WriteError> {
        let val: i16 = t.into();
        ctxt.write_bytes(&val.to_be_bytes())
    }
}

impl<T> WriteBinary<T> for U16Be
where
    T: Into<u16>,
{
    type Output = ();

    fn write<C: WriteContext>(ctxt: &mut C, t: T) -> Result<(), WriteError> {
        let val: u16 = t.into();
        ctxt.write_bytes(&val.to_be_bytes())
    }
}

impl<T> WriteBinary<T> for U24Be
where
    T: Into<u32>,
{
    type Output = ();

    fn write<C: WriteContext>(ctxt: &mut C, t: T) -> Result<(), WriteError> {
        let val: u32 = t.into();
        if val > 0xFF_FFFF {
            return Err(WriteError::BadValue);
        }
        ctxt.write_bytes(&val.to_be_bytes()[1..4])
    }
}

impl<T> WriteBinary<T> for I32Be
where
    T: Into<i32>,
{
    type Output = ();

    fn write<C: WriteContext>(ctxt: &mut C, t: T) -> Result<(), WriteError> {
        let val: i32 = t.into();
        ctxt.write_bytes(&val.to_be_bytes())
    }
}

impl<T> WriteBinary<T> for U32Be
where
    T: Into<u32>,
{
    type Output = ();

    fn write<C: WriteContext>(ctxt: &mut C, t: T) -> Result<(), WriteError> {
        let val: u32 = t.into();
        ctxt.write_bytes(&val.to_be_bytes())
    }
}

impl WriteContext for WriteBuffer {
    fn write_bytes(&mut self, data: &[u8]) -> Result<(), WriteError> {
        self.data.extend(data.iter());
        Ok(())
    }

    fn write_zeros(&mut self, count: usize) -> Result<(), WriteError> {
        let zeros = iter::repeat(0).take(count);
        self.data.extend(zeros);
        Ok(())
    }

    fn bytes_written(&self) -> usize {
        self.data.len()
    }
}

impl WriteContext for WriteCounter {
    fn write_bytes(&mut self, data: &[u8]) -> Result<(), WriteError> {
        self.count += data.len();
        Ok(())
    }

    fn write_zeros(&mut self, count: usize) -> Result<(), WriteError> {
        self.count += count;
        Ok(())
    }

    fn bytes_written(&self) -> usize {
        self.count
    }
}

impl WriteBuffer {
    /// Create a new, empty `WriteBuffer`
    pub fn new() -> Self {
        WriteBuffer { data: Vec::new() }
    }

    /// Retrieve a slice of the data held by this buffer
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Returns the current size of the data held by this buffer
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Consume `self` and return the inner buffer
    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

impl WriteCounter {
    /// Create a new, empty `WriteCounter`
    pub fn new() -> Self {
        WriteCounter { count: 0 }
    }
}
