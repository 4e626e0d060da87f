//! Access flags as they arrive from the class-file parser

use bitflags::bitflags;

bitflags! {
    /// Class access and property flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ClassFlags: u16 {
        const PUBLIC     = 0x0001;
        const FINAL      = 0x0010;
        const SUPER      = 0x0020;
        const INTERFACE  = 0x0200;
        const ABSTRACT   = 0x0400;
        const SYNTHETIC  = 0x1000;
        const ANNOTATION = 0x2000;
        const ENUM       = 0x4000;
    }
}

bitflags! {
    /// Method access and property flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MethodFlags: u16 {
        const PUBLIC       = 0x0001;
        const PRIVATE      = 0x0002;
        const PROTECTED    = 0x0004;
        const STATIC       = 0x0008;
        const FINAL        = 0x0010;
        const SYNCHRONIZED = 0x0020;
        const BRIDGE       = 0x0040;
        const VARARGS      = 0x0080;
        const NATIVE       = 0x0100;
        const ABSTRACT     = 0x0400;
        const STRICT       = 0x0800;
        const SYNTHETIC    = 0x1000;
    }
}

bitflags! {
    /// Field access and property flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FieldFlags: u16 {
        const PUBLIC    = 0x0001;
        const PRIVATE   = 0x0002;
        const PROTECTED = 0x0004;
        const STATIC    = 0x0008;
        const FINAL     = 0x0010;
        const VOLATILE  = 0x0040;
        const TRANSIENT = 0x0080;
        const SYNTHETIC = 0x1000;
        const ENUM      = 0x4000;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_flag_bits() {
        let f = MethodFlags::PUBLIC | MethodFlags::STATIC | MethodFlags::SYNCHRONIZED;
        assert!(f.contains(MethodFlags::STATIC));
        assert!(!f.contains(MethodFlags::NATIVE));
        assert_eq!(f.bits(), 0x0029);
    }

    #[test]
    fn test_class_interface_flag() {
        let f = ClassFlags::PUBLIC | ClassFlags::INTERFACE | ClassFlags::ABSTRACT;
        assert!(f.contains(ClassFlags::INTERFACE));
    }
}
