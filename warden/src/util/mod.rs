// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
pub mod dropkick;
pub mod framed;
pub mod validators;
